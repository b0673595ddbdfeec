use anyhow::{anyhow, Context, Result};
use serde_yaml::{Mapping, Value};

/// A stage of the package lifecycle with its own step list and operation
/// surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prepare,
    Install,
    Uninstall,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Install => "install",
            Self::Uninstall => "uninstall",
        }
    }

    /// Descriptor key holding this stage's declared step list.
    pub fn descriptor_key(self) -> &'static str {
        self.as_str()
    }
}

pub const KEY_ACTION: &str = "action";
pub const KEY_IF: &str = "if";
pub const KEY_IF_NOT: &str = "if not";
pub const KEY_TRANSFORM: &str = "$transform";
pub const KEY_GENERATED_UNINSTALL: &str = "generated uninstall";

/// One declarative step: a mapping with a required `action` key, optional
/// `if` / `if not` / `$transform` meta keys, and operation-specific
/// arguments. Key lookup treats spaces as word separators (`with file` and
/// `with_file` address the same argument).
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    map: Mapping,
}

fn normalize_key(key: &str) -> String {
    key.replace(' ', "_")
}

fn str_value(value: &Value) -> Option<String> {
    value.as_str().map(ToOwned::to_owned)
}

fn str_list_value(value: &Value) -> Option<Vec<String>> {
    let sequence = value.as_sequence()?;
    let mut out = Vec::with_capacity(sequence.len());
    for entry in sequence {
        out.push(entry.as_str()?.to_owned());
    }
    Some(out)
}

impl ActionRecord {
    pub fn new(operation: &str) -> Self {
        let mut map = Mapping::new();
        map.insert(Value::from(KEY_ACTION), Value::from(operation));
        Self { map }
    }

    pub fn from_mapping(map: Mapping) -> Self {
        Self { map }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Mapping(map) => Ok(Self { map }),
            other => Err(anyhow!(
                "a step must be a mapping with an 'action' key, got: {other:?}"
            )),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Mapping(self.map)
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.map
    }

    /// The operation name of this step.
    pub fn operation(&self) -> Result<String> {
        self.map
            .get(Value::from(KEY_ACTION))
            .and_then(str_value)
            .ok_or_else(|| anyhow!("step is missing the 'action' key: {:?}", self.map))
    }

    pub fn set_operation(&mut self, operation: &str) {
        self.map
            .insert(Value::from(KEY_ACTION), Value::from(operation));
    }

    fn lookup(&self, normalized: &str) -> Option<&Value> {
        self.map.iter().find_map(|(key, value)| {
            let key = key.as_str()?;
            (normalize_key(key) == normalized).then_some(value)
        })
    }

    pub fn has_arg(&self, normalized: &str) -> bool {
        self.lookup(normalized).is_some()
    }

    pub fn str_arg(&self, normalized: &str) -> Result<Option<String>> {
        match self.lookup(normalized) {
            None => Ok(None),
            Some(value) => str_value(value)
                .map(Some)
                .ok_or_else(|| anyhow!("argument '{normalized}' must be a string")),
        }
    }

    pub fn str_list_arg(&self, normalized: &str) -> Result<Option<Vec<String>>> {
        match self.lookup(normalized) {
            None => Ok(None),
            Some(value) => str_list_value(value)
                .map(Some)
                .ok_or_else(|| anyhow!("argument '{normalized}' must be a list of strings")),
        }
    }

    pub fn bool_arg(&self, normalized: &str, default: bool) -> Result<bool> {
        match self.lookup(normalized) {
            None => Ok(default),
            Some(value) => value
                .as_bool()
                .ok_or_else(|| anyhow!("argument '{normalized}' must be a boolean")),
        }
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.map.insert(Value::from(key), Value::from(value));
    }

    pub fn set_str_list(&mut self, key: &str, values: &[String]) {
        let seq = values.iter().map(|v| Value::from(v.as_str())).collect::<Vec<_>>();
        self.map.insert(Value::from(key), Value::Sequence(seq));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.map.insert(Value::from(key), Value::from(value));
    }

    pub fn remove_key(&mut self, key: &str) {
        self.map.remove(Value::from(key));
    }

    /// Condition identifiers from the `if` meta key.
    pub fn positive_conditions(&self) -> Result<Vec<String>> {
        self.condition_list(KEY_IF)
    }

    /// Condition identifiers from the `if not` meta key.
    pub fn negative_conditions(&self) -> Result<Vec<String>> {
        self.condition_list(KEY_IF_NOT)
    }

    fn condition_list(&self, key: &str) -> Result<Vec<String>> {
        match self.lookup(&normalize_key(key)) {
            None => Ok(Vec::new()),
            Some(value) => str_list_value(value)
                .ok_or_else(|| anyhow!("'{key}' must be a list of condition identifiers")),
        }
    }

    pub fn mentions_condition(&self, identifier: &str) -> bool {
        let positive = self.positive_conditions().unwrap_or_default();
        let negative = self.negative_conditions().unwrap_or_default();
        positive.iter().any(|c| c == identifier) || negative.iter().any(|c| c == identifier)
    }

    /// Identifiers of all transformers mentioned in the `$transform` meta key.
    pub fn transformer_names(&self) -> Vec<String> {
        let Some(Value::Mapping(meta)) = self.map.get(Value::from(KEY_TRANSFORM)) else {
            return Vec::new();
        };
        meta.keys().filter_map(|key| str_value(key)).collect()
    }

    /// Per-transformer override configuration. A missing entry means "use
    /// defaults"; a bare boolean is shorthand for `{enabled: <bool>}`.
    pub fn transformer_config(&self, identifier: &str) -> Result<Mapping> {
        let Some(Value::Mapping(meta)) = self.map.get(Value::from(KEY_TRANSFORM)) else {
            return Ok(Mapping::new());
        };
        match meta.get(Value::from(identifier)) {
            None => Ok(Mapping::new()),
            Some(Value::Mapping(cfg)) => Ok(cfg.clone()),
            Some(Value::Bool(enabled)) => {
                let mut cfg = Mapping::new();
                cfg.insert(Value::from("enabled"), Value::from(*enabled));
                Ok(cfg)
            }
            Some(other) => Err(anyhow!(
                "expected either a bool for switching transformer '{identifier}' \
                 or a mapping configuration, got: {other:?}"
            )),
        }
    }

    /// Remove one transformer's override; drops the `$transform` key entirely
    /// once the last override is consumed.
    pub fn strip_transformer_config(&mut self, identifier: &str) {
        if let Some(Value::Mapping(meta)) = self.map.get_mut(Value::from(KEY_TRANSFORM)) {
            meta.remove(Value::from(identifier));
            if meta.is_empty() {
                self.map.remove(Value::from(KEY_TRANSFORM));
            }
        }
    }

    /// Strip the gating and transformer meta keys, leaving only the operation
    /// name and its arguments.
    pub fn strip_meta_keys(&mut self) {
        let meta: Vec<Value> = self
            .map
            .keys()
            .filter(|key| {
                key.as_str().is_some_and(|key| {
                    let normalized = normalize_key(key);
                    normalized == normalize_key(KEY_IF)
                        || normalized == normalize_key(KEY_IF_NOT)
                        || key == KEY_TRANSFORM
                })
            })
            .cloned()
            .collect();
        for key in meta {
            self.map.remove(&key);
        }
    }

    /// Serialized one-line summary used in error and log messages.
    pub fn summary(&self) -> String {
        serde_yaml::to_string(&self.map)
            .map(|text| text.trim_end().replace('\n', "; "))
            .unwrap_or_else(|_| "<unprintable step>".to_string())
    }
}

/// The parsed `package.yaml` of one package: an ordered mapping whose known
/// keys have typed accessors. Unknown keys are preserved untouched so the
/// re-serialized descriptor stays forward compatible.
#[derive(Debug, Clone, Default)]
pub struct Descriptor {
    data: Mapping,
}

impl Descriptor {
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let value: Value =
            serde_yaml::from_str(input).context("failed to parse package descriptor")?;
        match value {
            Value::Null => Ok(Self::default()),
            Value::Mapping(data) => Ok(Self { data }),
            other => Err(anyhow!(
                "package descriptor must be a mapping, got: {other:?}"
            )),
        }
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(&self.data).context("failed to serialize package descriptor")
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(Value::from(key))
    }

    pub fn description(&self) -> Option<String> {
        self.get("description").and_then(str_value)
    }

    pub fn support_flag(&self) -> bool {
        self.get("support").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Whether managing the package globally requires superuser access.
    pub fn requires_superuser(&self) -> bool {
        self.get("superuser").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn depends_on_parent(&self) -> bool {
        self.get("depend on parent")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn declared_dependencies(&self) -> Vec<String> {
        self.get("dependencies")
            .and_then(str_list_value)
            .unwrap_or_default()
    }

    pub fn has_steps(&self, stage: Stage) -> bool {
        self.get(stage.descriptor_key()).is_some()
    }

    pub fn has_uninstall_steps(&self) -> bool {
        self.get(Stage::Uninstall.descriptor_key()).is_some()
            || self.get(KEY_GENERATED_UNINSTALL).is_some()
    }

    pub fn steps(&self, stage: Stage) -> Result<Vec<ActionRecord>> {
        self.step_list(stage.descriptor_key())
    }

    pub fn generated_uninstall_steps(&self) -> Result<Vec<ActionRecord>> {
        self.step_list(KEY_GENERATED_UNINSTALL)
    }

    fn step_list(&self, key: &str) -> Result<Vec<ActionRecord>> {
        let Some(value) = self.get(key) else {
            return Ok(Vec::new());
        };
        let sequence = value
            .as_sequence()
            .ok_or_else(|| anyhow!("'{key}' must be a list of steps"))?;
        sequence
            .iter()
            .map(|entry| ActionRecord::from_value(entry.clone()))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("invalid step in '{key}'"))
    }

    pub fn set_generated_uninstall(&mut self, steps: Vec<ActionRecord>) {
        let sequence = steps
            .into_iter()
            .map(ActionRecord::into_value)
            .collect::<Vec<_>>();
        self.data
            .insert(Value::from(KEY_GENERATED_UNINSTALL), Value::Sequence(sequence));
    }

    /// Whether any step in any stage is gated on the given condition. Such a
    /// package can take additional optional steps when the condition holds,
    /// without it being mandatory.
    pub fn suggests_condition(&self, identifier: &str) -> bool {
        let lists = [
            Stage::Prepare.descriptor_key(),
            Stage::Install.descriptor_key(),
            Stage::Uninstall.descriptor_key(),
            KEY_GENERATED_UNINSTALL,
        ];
        lists.iter().any(|key| {
            self.step_list(key)
                .map(|steps| steps.iter().any(|step| step.mentions_condition(identifier)))
                .unwrap_or(false)
        })
    }
}
