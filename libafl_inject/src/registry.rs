//! The set of loaded target descriptors, grouped by function.

use strum::EnumCount;

use crate::{
    config::{EngineConfig, UnknownFunctionPolicy},
    descriptor::{RawDescriptor, TargetDescriptor},
    function::Function,
    Error,
};

/// All descriptors of one load, grouped by the function they target.
///
/// Within a function, descriptors keep the order of the list they were loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRegistry {
    by_function: Vec<Vec<TargetDescriptor>>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    /// An empty registry, targeting nothing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_function: vec![Vec::new(); Function::COUNT],
        }
    }

    /// Builds a registry from already validated descriptors.
    pub fn from_descriptors<I>(descriptors: I) -> Self
    where
        I: IntoIterator<Item = TargetDescriptor>,
    {
        let mut ret = Self::new();
        for desc in descriptors {
            ret.by_function[desc.function().index()].push(desc);
        }
        ret
    }

    /// Parses a json descriptor list.
    ///
    /// Any schema violation fails the whole list. An unknown `functionName` fails it as well,
    /// unless `config` asks for [`UnknownFunctionPolicy::SkipDescriptor`].
    pub fn from_json(text: &str, config: &EngineConfig) -> Result<Self, Error> {
        let raws: Vec<RawDescriptor> = serde_json::from_str(text)?;

        let mut descriptors = Vec::with_capacity(raws.len());
        for (i, raw) in raws.into_iter().enumerate() {
            match TargetDescriptor::from_raw(raw, config.techniques, config.max_buffer_prefix) {
                Ok(desc) => descriptors.push(desc),
                Err(Error::KeyNotFound(name))
                    if config.unknown_function == UnknownFunctionPolicy::SkipDescriptor =>
                {
                    log::warn!("Skipping target #{i}: unknown function {name}");
                }
                Err(err) => {
                    log::warn!("Rejecting target list, target #{i} is invalid: {err}");
                    return Err(err);
                }
            }
        }
        Ok(Self::from_descriptors(descriptors))
    }

    /// Serializes all descriptors back to a json list.
    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&self.iter().collect::<Vec<_>>())?)
    }

    /// The descriptors targeting `function`.
    #[inline]
    #[must_use]
    pub fn descriptors_for(&self, function: Function) -> &[TargetDescriptor] {
        &self.by_function[function.index()]
    }

    /// All descriptors, grouped by function.
    pub fn iter(&self) -> impl Iterator<Item = &TargetDescriptor> {
        self.by_function.iter().flatten()
    }

    /// Total number of descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_function.iter().map(Vec::len).sum()
    }

    /// `true` if nothing is targeted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_function.iter().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::TargetRegistry;
    use crate::{
        config::{EngineConfig, UnknownFunctionPolicy},
        descriptor::{MATCH_INDEX, MATCH_RETN_ADDRESS},
        function::Function,
        Error,
    };

    fn target(function: &str, index: u64) -> serde_json::Value {
        json!({
            "selected": true,
            "index": index,
            "mode": MATCH_INDEX,
            "retAddrOffset": 0,
            "retAddrCount": 0,
            "functionName": function,
        })
    }

    #[test]
    fn test_from_json_groups() {
        let text = json!([target("ReadFile", 0), target("recv", 1), target("ReadFile", 2)]);
        let registry = TargetRegistry::from_json(&text.to_string(), &EngineConfig::default())
            .unwrap();
        assert_eq!(registry.len(), 3);
        let reads = registry.descriptors_for(Function::ReadFile);
        assert_eq!(reads.len(), 2);
        assert_eq!(reads[0].index(), 0);
        assert_eq!(reads[1].index(), 2);
        assert!(registry.descriptors_for(Function::Fread).is_empty());
    }

    #[test]
    fn test_from_json_schema_errors() {
        let config = EngineConfig::default();
        assert!(TargetRegistry::from_json("not json", &config).is_err());
        assert!(TargetRegistry::from_json("{}", &config).is_err());

        let mut missing = target("ReadFile", 0);
        missing.as_object_mut().unwrap().remove("retAddrCount");
        let text = json!([missing]).to_string();
        assert!(matches!(
            TargetRegistry::from_json(&text, &config),
            Err(Error::Serialize(_))
        ));

        let mut wrong_type = target("ReadFile", 0);
        wrong_type["functionName"] = json!(42);
        let text = json!([target("recv", 0), wrong_type]).to_string();
        assert!(TargetRegistry::from_json(&text, &config).is_err());

        let mut bad_mode = target("ReadFile", 0);
        bad_mode["mode"] = json!(0);
        let text = json!([bad_mode]).to_string();
        assert!(matches!(
            TargetRegistry::from_json(&text, &config),
            Err(Error::IllegalArgument(_))
        ));
    }

    #[test]
    fn test_unknown_function_policy() {
        let text = json!([target("ReadFile", 0), target("NtReadFile", 1)]).to_string();

        let strict = EngineConfig::default();
        assert!(matches!(
            TargetRegistry::from_json(&text, &strict),
            Err(Error::KeyNotFound(_))
        ));

        let lenient = EngineConfig::builder()
            .unknown_function(UnknownFunctionPolicy::SkipDescriptor)
            .build();
        let registry = TargetRegistry::from_json(&text, &lenient).unwrap();
        assert_eq!(registry.len(), 1);

        // skipping only covers unknown names, not broken descriptors
        let mut bad_mode = target("ReadFile", 0);
        bad_mode["mode"] = json!(MATCH_INDEX | MATCH_RETN_ADDRESS | (1 << 20));
        let text = json!([bad_mode]).to_string();
        assert!(TargetRegistry::from_json(&text, &lenient).is_err());
    }

    #[test]
    fn test_to_json_reloads() {
        let text = json!([target("fread", 4), target("MapViewOfFile", 9)]).to_string();
        let config = EngineConfig::default();
        let registry = TargetRegistry::from_json(&text, &config).unwrap();
        let again = TargetRegistry::from_json(&registry.to_json().unwrap(), &config).unwrap();
        assert_eq!(registry, again);
    }
}
