use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    println!("cargo:rustc-env=BENCHKEEPER_BUILD_N={n}");
}
