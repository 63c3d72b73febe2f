use crate::{
    dataset::{Column, Dataset},
    metrics::MetricValue,
};
use benchkeeper_protocol::{EngineError, ErrorCode, Label};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, collections::HashSet, fmt, sync::Arc};

pub type ResolvedParams = BTreeMap<String, Value>;

pub type MethodFn = dyn Fn(&Dataset, &ResolvedParams) -> Result<Value, String> + Send + Sync;
pub type PostFn = dyn Fn(&Value) -> Result<Column, String> + Send + Sync;
pub type MetricFn =
    dyn Fn(&Column, &Column, &ResolvedParams) -> Result<MetricValue, String> + Send + Sync;

/// Assay name used for methods without post-processors.
pub const DEFAULT_ASSAY: &str = "default";

/// The serializable identity of a callable. `source` is what gets hashed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallableRecord {
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
}

impl CallableRecord {
    pub fn new(name: &str, source: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            source: source.map(|s| s.to_string()),
        }
    }
}

/// A user-supplied function stored by value. Equality for staleness purposes
/// is decided by `record` alone.
pub struct Callable<F: ?Sized> {
    pub record: CallableRecord,
    pub func: Option<Arc<F>>,
}

impl<F: ?Sized> Callable<F> {
    pub fn unbound(record: CallableRecord) -> Self {
        Self { record, func: None }
    }

    pub fn bind(&mut self, func: Arc<F>) {
        self.func = Some(func);
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn is_bound(&self) -> bool {
        self.func.is_some()
    }
}

impl Callable<MethodFn> {
    /// `source` is the text fingerprinted for this function; pass `None` for
    /// a closure with no stable serialized form.
    pub fn method<G>(name: &str, source: Option<&str>, func: G) -> Self
    where
        G: Fn(&Dataset, &ResolvedParams) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            record: CallableRecord::new(name, source),
            func: Some(Arc::new(func)),
        }
    }
}

impl Callable<PostFn> {
    pub fn post<G>(name: &str, source: Option<&str>, func: G) -> Self
    where
        G: Fn(&Value) -> Result<Column, String> + Send + Sync + 'static,
    {
        Self {
            record: CallableRecord::new(name, source),
            func: Some(Arc::new(func)),
        }
    }
}

impl Callable<MetricFn> {
    pub fn metric<G>(name: &str, source: Option<&str>, func: G) -> Self
    where
        G: Fn(&Column, &Column, &ResolvedParams) -> Result<MetricValue, String>
            + Send
            + Sync
            + 'static,
    {
        Self {
            record: CallableRecord::new(name, source),
            func: Some(Arc::new(func)),
        }
    }
}

impl<F: ?Sized> Clone for Callable<F> {
    fn clone(&self) -> Self {
        Self {
            record: self.record.clone(),
            func: self.func.clone(),
        }
    }
}

impl<F: ?Sized> fmt::Debug for Callable<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable")
            .field("name", &self.record.name)
            .field("has_source", &self.record.source.is_some())
            .field("bound", &self.func.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Literal(Value),
    /// Evaluated at run time. `dataset.<key>` reads a dataset attribute,
    /// anything else is looked up in `context`.
    Deferred {
        expr: String,
        #[serde(default)]
        context: BTreeMap<String, Value>,
    },
}

impl ParamValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        ParamValue::Literal(value.into())
    }

    pub fn deferred(expr: &str) -> Self {
        ParamValue::Deferred {
            expr: expr.to_string(),
            context: BTreeMap::new(),
        }
    }

    pub fn resolve(&self, dataset: Option<&Dataset>) -> Result<Value, EngineError> {
        match self {
            ParamValue::Literal(value) => Ok(value.clone()),
            ParamValue::Deferred { expr, context } => {
                if let Some(key) = expr.strip_prefix("dataset.") {
                    let dataset = dataset.ok_or_else(|| {
                        EngineError::new(
                            ErrorCode::DatasetMissing,
                            format!("Deferred parameter '{expr}' needs the dataset"),
                        )
                    })?;
                    return dataset.attributes.get(key).cloned().ok_or_else(|| {
                        EngineError::new(
                            ErrorCode::InvalidInput,
                            format!("Dataset has no attribute '{key}' for parameter '{expr}'"),
                        )
                    });
                }
                context.get(expr).cloned().ok_or_else(|| {
                    EngineError::new(
                        ErrorCode::InvalidInput,
                        format!("Could not resolve deferred parameter '{expr}'"),
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub name: String,
    pub value: ParamValue,
}

impl ParamEntry {
    pub fn new(name: &str, value: ParamValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostEntry {
    pub key: String,
    pub function: CallableRecord,
}

impl PostEntry {
    pub fn new(key: &str, function: CallableRecord) -> Self {
        Self {
            key: key.to_string(),
            function,
        }
    }
}

pub fn resolve_params(
    params: &[(String, ParamValue)],
    dataset: Option<&Dataset>,
) -> Result<ResolvedParams, EngineError> {
    params
        .iter()
        .map(|(name, value)| Ok((name.clone(), value.resolve(dataset)?)))
        .collect()
}

#[derive(Debug, Clone)]
pub struct MethodDefinition {
    pub label: Label,
    pub function: Callable<MethodFn>,
    pub params: Vec<(String, ParamValue)>,
    pub meta: BTreeMap<String, Value>,
    pub post: Vec<(String, Callable<PostFn>)>,
    pub version: Option<String>,
}

impl MethodDefinition {
    pub fn new(label: &str, function: Callable<MethodFn>) -> Self {
        Self {
            label: label.to_string(),
            function,
            params: vec![],
            meta: BTreeMap::new(),
            post: vec![],
            version: None,
        }
    }

    pub fn with_param(mut self, name: &str, value: ParamValue) -> Self {
        self.set_param(name, value);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    pub fn with_post(mut self, key: &str, function: Callable<PostFn>) -> Self {
        if let Some(slot) = self.post.iter_mut().find(|(k, _)| k == key) {
            slot.1 = function;
        } else {
            self.post.push((key.to_string(), function));
        }
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Replaces an existing parameter in place, keeping its position.
    pub fn set_param(&mut self, name: &str, value: ParamValue) {
        if let Some(slot) = self.params.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.params.push((name.to_string(), value));
        }
    }

    pub fn assay_names(&self) -> Vec<String> {
        if self.post.is_empty() {
            vec![DEFAULT_ASSAY.to_string()]
        } else {
            self.post.iter().map(|(k, _)| k.clone()).collect()
        }
    }

    pub fn record(&self) -> MethodRecord {
        MethodRecord {
            label: self.label.clone(),
            function: self.function.record.clone(),
            params: self
                .params
                .iter()
                .map(|(name, value)| ParamEntry::new(name, value.clone()))
                .collect(),
            meta: self.meta.clone(),
            post: self
                .post
                .iter()
                .map(|(key, f)| PostEntry::new(key, f.record.clone()))
                .collect(),
            version: self.version.clone(),
        }
    }

    pub fn from_record(record: &MethodRecord) -> Self {
        Self {
            label: record.label.clone(),
            function: Callable::unbound(record.function.clone()),
            params: record
                .params
                .iter()
                .map(|p| (p.name.clone(), p.value.clone()))
                .collect(),
            meta: record.meta.clone(),
            post: record
                .post
                .iter()
                .map(|p| (p.key.clone(), Callable::unbound(p.function.clone())))
                .collect(),
            version: record.version.clone(),
        }
    }
}

/// Everything about a method definition except the function objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRecord {
    pub label: Label,
    pub function: CallableRecord,
    #[serde(default)]
    pub params: Vec<ParamEntry>,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
    #[serde(default)]
    pub post: Vec<PostEntry>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MetricDefinition {
    pub assay: String,
    pub label: Label,
    pub function: Callable<MetricFn>,
    pub params: Vec<(String, ParamValue)>,
}

impl MetricDefinition {
    pub fn new(assay: &str, label: &str, function: Callable<MetricFn>) -> Self {
        Self {
            assay: assay.to_string(),
            label: label.to_string(),
            function,
            params: vec![],
        }
    }

    pub fn with_param(mut self, name: &str, value: ParamValue) -> Self {
        if let Some(slot) = self.params.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value;
        } else {
            self.params.push((name.to_string(), value));
        }
        self
    }

    pub fn key(&self) -> (String, Label) {
        (self.assay.clone(), self.label.clone())
    }

    pub fn record(&self) -> MetricRecord {
        MetricRecord {
            assay: self.assay.clone(),
            label: self.label.clone(),
            function: self.function.record.clone(),
            params: self
                .params
                .iter()
                .map(|(name, value)| ParamEntry::new(name, value.clone()))
                .collect(),
        }
    }

    pub fn from_record(record: &MetricRecord) -> Self {
        Self {
            assay: record.assay.clone(),
            label: record.label.clone(),
            function: Callable::unbound(record.function.clone()),
            params: record
                .params
                .iter()
                .map(|p| (p.name.clone(), p.value.clone()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub assay: String,
    pub label: Label,
    pub function: CallableRecord,
    #[serde(default)]
    pub params: Vec<ParamEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionSetRecord {
    pub methods: Vec<MethodRecord>,
    pub metrics: Vec<MetricRecord>,
}

impl DefinitionSetRecord {
    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Could not read definitions file '{path}': {e}"))?;
        serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("Could not parse definitions JSON '{path}': {e}"))
    }
}

/// All method and metric definitions for one benchmarking round. The engine
/// only ever reads it.
#[derive(Debug, Clone, Default)]
pub struct DefinitionSet {
    methods: Vec<MethodDefinition>,
    metrics: Vec<MetricDefinition>,
}

fn collision(message: String) -> EngineError {
    EngineError::new(ErrorCode::LabelCollision, message)
}

impl DefinitionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from parts, rejecting duplicate labels.
    pub fn from_parts(
        methods: Vec<MethodDefinition>,
        metrics: Vec<MetricDefinition>,
    ) -> Result<Self, EngineError> {
        let ret = Self { methods, metrics };
        ret.validate()?;
        Ok(ret)
    }

    pub fn from_record(record: &DefinitionSetRecord) -> Result<Self, EngineError> {
        Self::from_parts(
            record.methods.iter().map(MethodDefinition::from_record).collect(),
            record.metrics.iter().map(MetricDefinition::from_record).collect(),
        )
    }

    pub fn record(&self) -> DefinitionSetRecord {
        DefinitionSetRecord {
            methods: self.methods.iter().map(|m| m.record()).collect(),
            metrics: self.metrics.iter().map(|m| m.record()).collect(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen: HashSet<&str> = HashSet::new();
        for method in &self.methods {
            if !seen.insert(method.label.as_str()) {
                return Err(collision(format!(
                    "Method label '{}' is defined more than once",
                    method.label
                )));
            }
            let mut keys: HashSet<&str> = HashSet::new();
            for (key, _) in &method.post {
                if !keys.insert(key.as_str()) {
                    return Err(EngineError::new(
                        ErrorCode::InvalidInput,
                        format!(
                            "Method '{}' has post-processor '{key}' more than once",
                            method.label
                        ),
                    ));
                }
            }
        }
        let mut seen_metrics: HashSet<(&str, &str)> = HashSet::new();
        for metric in &self.metrics {
            if !seen_metrics.insert((metric.assay.as_str(), metric.label.as_str())) {
                return Err(collision(format!(
                    "Metric '{}' is defined more than once for assay '{}'",
                    metric.label, metric.assay
                )));
            }
        }
        Ok(())
    }

    pub fn add_method(&mut self, method: MethodDefinition) -> Result<(), EngineError> {
        if self.method(&method.label).is_some() {
            return Err(collision(format!(
                "Method label '{}' already exists",
                method.label
            )));
        }
        self.methods.push(method);
        Ok(())
    }

    /// Edits a method in place. The edit is rolled back if it leaves the set
    /// invalid (e.g. a relabel onto an existing label).
    pub fn modify_method<F>(&mut self, label: &str, edit: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut MethodDefinition),
    {
        let idx = self
            .methods
            .iter()
            .position(|m| m.label == label)
            .ok_or_else(|| {
                EngineError::new(ErrorCode::NotFound, format!("No method labelled '{label}'"))
            })?;
        let before = self.methods[idx].clone();
        edit(&mut self.methods[idx]);
        if let Err(e) = self.validate() {
            self.methods[idx] = before;
            return Err(e);
        }
        Ok(())
    }

    pub fn drop_method(&mut self, label: &str) -> Result<MethodDefinition, EngineError> {
        let idx = self
            .methods
            .iter()
            .position(|m| m.label == label)
            .ok_or_else(|| {
                EngineError::new(ErrorCode::NotFound, format!("No method labelled '{label}'"))
            })?;
        Ok(self.methods.remove(idx))
    }

    pub fn add_metric(&mut self, metric: MetricDefinition) -> Result<(), EngineError> {
        if self.metric(&metric.assay, &metric.label).is_some() {
            return Err(collision(format!(
                "Metric '{}' already exists for assay '{}'",
                metric.label, metric.assay
            )));
        }
        self.metrics.push(metric);
        Ok(())
    }

    pub fn drop_metric(&mut self, assay: &str, label: &str) -> Result<MetricDefinition, EngineError> {
        let idx = self
            .metrics
            .iter()
            .position(|m| m.assay == assay && m.label == label)
            .ok_or_else(|| {
                EngineError::new(
                    ErrorCode::NotFound,
                    format!("No metric '{label}' for assay '{assay}'"),
                )
            })?;
        Ok(self.metrics.remove(idx))
    }

    pub fn methods(&self) -> &[MethodDefinition] {
        &self.methods
    }

    pub fn metrics(&self) -> &[MetricDefinition] {
        &self.metrics
    }

    pub fn method(&self, label: &str) -> Option<&MethodDefinition> {
        self.methods.iter().find(|m| m.label == label)
    }

    pub fn method_mut(&mut self, label: &str) -> Option<&mut MethodDefinition> {
        self.methods.iter_mut().find(|m| m.label == label)
    }

    pub fn metric(&self, assay: &str, label: &str) -> Option<&MetricDefinition> {
        self.metrics
            .iter()
            .find(|m| m.assay == assay && m.label == label)
    }

    pub fn metric_mut(&mut self, assay: &str, label: &str) -> Option<&mut MetricDefinition> {
        self.metrics
            .iter_mut()
            .find(|m| m.assay == assay && m.label == label)
    }

    pub fn labels(&self) -> Vec<Label> {
        self.methods.iter().map(|m| m.label.clone()).collect()
    }

    /// Mutable access for rebinding callables. Labels must not be edited
    /// through these slices.
    pub(crate) fn callables_mut(&mut self) -> (&mut [MethodDefinition], &mut [MetricDefinition]) {
        (&mut self.methods, &mut self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_method(label: &str) -> MethodDefinition {
        MethodDefinition::new(
            label,
            Callable::method("noop", Some("|_, _| Ok(json!([]))"), |_, _| Ok(json!([]))),
        )
    }

    #[test]
    fn duplicate_method_label_is_rejected() {
        let mut set = DefinitionSet::new();
        set.add_method(noop_method("a")).unwrap();
        let err = set.add_method(noop_method("a")).unwrap_err();
        assert_eq!(err.code, ErrorCode::LabelCollision);
        let err = DefinitionSet::from_parts(vec![noop_method("a"), noop_method("a")], vec![])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LabelCollision);
    }

    #[test]
    fn relabel_collision_rolls_back() {
        let mut set = DefinitionSet::new();
        set.add_method(noop_method("a")).unwrap();
        set.add_method(noop_method("b").with_meta("k", 1)).unwrap();
        let err = set
            .modify_method("b", |m| {
                m.label = "a".to_string();
                m.meta.clear();
            })
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::LabelCollision);
        let b = set.method("b").unwrap();
        assert_eq!(b.meta.get("k"), Some(&json!(1)));
    }

    #[test]
    fn modify_and_drop_method() {
        let mut set = DefinitionSet::new();
        set.add_method(noop_method("a")).unwrap();
        set.modify_method("a", |m| m.set_param("alpha", ParamValue::literal(0.1)))
            .unwrap();
        assert_eq!(set.method("a").unwrap().params.len(), 1);
        assert_eq!(
            set.modify_method("zz", |_| {}).unwrap_err().code,
            ErrorCode::NotFound
        );
        set.drop_method("a").unwrap();
        assert!(set.methods().is_empty());
    }

    #[test]
    fn record_round_trip_leaves_callables_unbound() {
        let mut set = DefinitionSet::new();
        set.add_method(
            noop_method("a")
                .with_param("alpha", ParamValue::literal(0.05))
                .with_version("2.0"),
        )
        .unwrap();
        let record = set.record();
        let text = serde_json::to_string(&record).unwrap();
        let back: DefinitionSetRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
        let rebuilt = DefinitionSet::from_record(&back).unwrap();
        assert!(!rebuilt.method("a").unwrap().function.is_bound());
        assert_eq!(rebuilt.record(), record);
    }

    #[test]
    fn deferred_params_resolve_against_dataset_then_context() {
        let mut data = Dataset::default();
        data.attributes.insert("alpha".to_string(), json!(0.01));
        assert_eq!(
            ParamValue::deferred("dataset.alpha")
                .resolve(Some(&data))
                .unwrap(),
            json!(0.01)
        );
        let ctx = ParamValue::Deferred {
            expr: "threads".to_string(),
            context: BTreeMap::from([("threads".to_string(), json!(4))]),
        };
        assert_eq!(ctx.resolve(None).unwrap(), json!(4));
        assert_eq!(
            ParamValue::deferred("dataset.alpha")
                .resolve(None)
                .unwrap_err()
                .code,
            ErrorCode::DatasetMissing
        );
        assert_eq!(
            ParamValue::deferred("nope").resolve(Some(&data)).unwrap_err().code,
            ErrorCode::InvalidInput
        );
    }

    #[test]
    fn assay_names_follow_post_processors() {
        let plain = noop_method("a");
        assert_eq!(plain.assay_names(), vec![DEFAULT_ASSAY.to_string()]);
        let post = plain.with_post(
            "pv",
            Callable::post("pv", Some("|_| Ok(vec![])"), |_| Ok(vec![])),
        );
        assert_eq!(post.assay_names(), vec!["pv".to_string()]);
    }
}
