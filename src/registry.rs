//! Name-keyed implementations for callables whose definitions were loaded
//! from JSON or rebuilt from a store, where only the record survives.

use crate::{
    dataset::{Column, Dataset},
    definition::{Callable, DefinitionSet, MethodFn, MetricFn, PostFn, ResolvedParams},
    metrics::{builtin, MetricValue},
};
use log::debug;
use serde_json::Value;
use std::{collections::HashMap, fmt, sync::Arc};

const DEFAULT_ALPHA: f64 = 0.05;

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    methods: HashMap<String, Arc<MethodFn>>,
    posts: HashMap<String, Arc<PostFn>>,
    metrics: HashMap<String, Arc<MetricFn>>,
}

fn alpha(params: &ResolvedParams) -> f64 {
    params
        .get("alpha")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_ALPHA)
}

fn bind_one<F: ?Sized>(
    callable: &mut Callable<F>,
    table: &HashMap<String, Arc<F>>,
    owner: &str,
    unresolved: &mut Vec<String>,
) {
    if callable.is_bound() {
        return;
    }
    match table.get(callable.name()) {
        Some(func) => callable.bind(func.clone()),
        None => unresolved.push(format!("{owner}: '{}'", callable.name())),
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the p-value metrics from `metrics::builtin`.
    pub fn with_builtins() -> Self {
        let mut ret = Self::new();
        ret.register_metric("false_discovery_rate", |pvalues, truth, params| {
            Ok(builtin::false_discovery_rate(pvalues, truth, alpha(params)))
        });
        ret.register_metric("true_positive_rate", |pvalues, truth, params| {
            Ok(builtin::true_positive_rate(pvalues, truth, alpha(params)))
        });
        ret
    }

    pub fn register_method<G>(&mut self, name: &str, func: G)
    where
        G: Fn(&Dataset, &ResolvedParams) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.methods.insert(name.to_string(), Arc::new(func));
    }

    pub fn register_post<G>(&mut self, name: &str, func: G)
    where
        G: Fn(&Value) -> Result<Column, String> + Send + Sync + 'static,
    {
        self.posts.insert(name.to_string(), Arc::new(func));
    }

    pub fn register_metric<G>(&mut self, name: &str, func: G)
    where
        G: Fn(&Column, &Column, &ResolvedParams) -> Result<MetricValue, String>
            + Send
            + Sync
            + 'static,
    {
        self.metrics.insert(name.to_string(), Arc::new(func));
    }

    /// Binds every unbound callable in `defs` that has a registered
    /// implementation. Returns a description of each one left unbound.
    pub fn bind(&self, defs: &mut DefinitionSet) -> Vec<String> {
        let mut unresolved = vec![];
        let (methods, metrics) = defs.callables_mut();
        for method in methods.iter_mut() {
            let owner = format!("method '{}'", method.label);
            bind_one(&mut method.function, &self.methods, &owner, &mut unresolved);
            for (key, post) in method.post.iter_mut() {
                let owner = format!("method '{}' post-processor '{key}'", method.label);
                bind_one(post, &self.posts, &owner, &mut unresolved);
            }
        }
        for metric in metrics.iter_mut() {
            let owner = format!("metric '{}/{}'", metric.assay, metric.label);
            bind_one(&mut metric.function, &self.metrics, &owner, &mut unresolved);
        }
        debug!("bound definitions, {} callable(s) unresolved", unresolved.len());
        unresolved
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn names<V: ?Sized>(table: &HashMap<String, Arc<V>>) -> Vec<&str> {
            let mut ret: Vec<&str> = table.keys().map(String::as_str).collect();
            ret.sort_unstable();
            ret
        }
        f.debug_struct("FunctionRegistry")
            .field("methods", &names(&self.methods))
            .field("posts", &names(&self.posts))
            .field("metrics", &names(&self.metrics))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{
        CallableRecord, DefinitionSetRecord, MethodRecord, MetricRecord, PostEntry,
    };
    use crate::executor::run_method;
    use std::collections::BTreeMap;

    fn loaded() -> DefinitionSet {
        let record = DefinitionSetRecord {
            methods: vec![MethodRecord {
                label: "m".to_string(),
                function: CallableRecord::new("ones", Some("ones")),
                params: vec![],
                meta: BTreeMap::new(),
                post: vec![PostEntry::new("pv", CallableRecord::new("identity", Some("id")))],
                version: None,
            }],
            metrics: vec![MetricRecord {
                assay: "pv".to_string(),
                label: "fdr".to_string(),
                function: CallableRecord::new("false_discovery_rate", Some("fdr")),
                params: vec![],
            }],
        };
        DefinitionSet::from_record(&record).unwrap()
    }

    #[test]
    fn bind_reports_missing_names() {
        let mut defs = loaded();
        let unresolved = FunctionRegistry::with_builtins().bind(&mut defs);
        assert_eq!(unresolved.len(), 2);
        assert!(unresolved[0].contains("'ones'"));
        assert!(unresolved[1].contains("post-processor 'pv'"));
        assert!(defs.metric("pv", "fdr").unwrap().function.is_bound());
    }

    #[test]
    fn bound_definitions_execute() {
        let mut registry = FunctionRegistry::with_builtins();
        registry.register_method("ones", |_, _| Ok(serde_json::json!([0.01, 0.2])));
        registry.register_post("identity", |raw| {
            crate::dataset::column_from_value(raw).ok_or_else(|| "not a column".to_string())
        });
        let mut defs = loaded();
        assert!(registry.bind(&mut defs).is_empty());
        let p = run_method(defs.method("m").unwrap(), Some(&Dataset::default()), false).unwrap();
        assert_eq!(p.assays["pv"], vec![Some(0.01), Some(0.2)]);
    }

    #[test]
    fn bound_callables_are_not_replaced() {
        let mut defs = loaded();
        let mut first = FunctionRegistry::new();
        first.register_method("ones", |_, _| Ok(serde_json::json!([1.0])));
        first.bind(&mut defs);
        let mut second = FunctionRegistry::new();
        second.register_method("ones", |_, _| Ok(serde_json::json!([2.0])));
        second.bind(&mut defs);
        let func = defs.method("m").unwrap().function.func.clone().unwrap();
        assert_eq!(func(&Dataset::default(), &BTreeMap::new()), Ok(serde_json::json!([1.0])));
    }
}
