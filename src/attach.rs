//! Attached-device declarations and cardinality checking.
//!
//! An [`AttachSpec`] states which collaborator devices a type requires, the
//! capability they must provide and how many of them may be configured.
//! [`AttachSpec::resolve`] turns the raw configured value into the list of
//! device names to wire up, or fails with a `Configuration` error.

use serde_json::Value;
use std::collections::BTreeSet;

use crate::device::spec::Capability;
use crate::error::{DaqError, DaqResult};

/// How many devices an attach slot takes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Multiplicity {
    /// Exactly one device.
    Single,
    /// One or more devices (zero when optional).
    Unlimited,
    /// One of a finite set of counts; `{n}` means exactly `n`.
    Counts(BTreeSet<usize>),
}

/// Static description of an attached-device slot.
#[derive(Debug, Clone)]
pub struct AttachSpec {
    pub description: String,
    pub capability: Capability,
    pub optional: bool,
    pub multiplicity: Multiplicity,
    /// If the configured device cannot be found at creation time, attach
    /// "absent" instead of failing.
    pub tolerate_missing: bool,
}

impl AttachSpec {
    pub fn new(description: impl Into<String>, capability: Capability) -> Self {
        Self {
            description: description.into(),
            capability,
            optional: false,
            multiplicity: Multiplicity::Single,
            tolerate_missing: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.multiplicity = Multiplicity::Unlimited;
        self
    }

    /// Allow any of the given counts. An empty set is a definition error.
    pub fn counts(mut self, counts: impl IntoIterator<Item = usize>) -> DaqResult<Self> {
        let counts: BTreeSet<usize> = counts.into_iter().collect();
        if counts.is_empty() {
            return Err(DaqError::Programming(format!(
                "attach '{}': allowed counts should be non-empty",
                self.description
            )));
        }
        self.multiplicity = Multiplicity::Counts(counts);
        Ok(self)
    }

    pub fn exactly(self, n: usize) -> DaqResult<Self> {
        self.counts([n])
    }

    pub fn tolerate_missing(mut self) -> Self {
        self.tolerate_missing = true;
        self
    }

    fn count_ok(&self, count: usize) -> bool {
        if count == 0 && self.optional {
            return true;
        }
        match &self.multiplicity {
            Multiplicity::Single => count == 1,
            Multiplicity::Unlimited => count > 0,
            Multiplicity::Counts(counts) => counts.contains(&count),
        }
    }

    /// Check `configured` against the cardinality policy of slot `aname`.
    ///
    /// Returns one entry per attached position; `None` marks an absent
    /// device (only produced for an unconfigured optional single slot or an
    /// explicit `null` in the list of an optional slot).
    pub fn resolve(
        &self,
        device: &str,
        aname: &str,
        configured: Option<&Value>,
    ) -> DaqResult<Vec<Option<String>>> {
        let args = configured_names(device, aname, configured)?;
        if !self.optional && args.iter().any(Option::is_none) {
            return Err(DaqError::config(
                device,
                format!("missing device in configuration for '{aname}'"),
            ));
        }

        match &self.multiplicity {
            Multiplicity::Single => {
                if !self.count_ok(args.len()) {
                    return Err(DaqError::config(
                        device,
                        format!("device misses device '{aname}' in configuration"),
                    ));
                }
                if args.is_empty() {
                    Ok(vec![None])
                } else {
                    Ok(args)
                }
            }
            Multiplicity::Unlimited => {
                if self.count_ok(args.len()) {
                    Ok(args)
                } else {
                    Err(DaqError::config(
                        device,
                        format!(
                            "wrong number of devices ({}) for '{aname}' in configuration",
                            args.len()
                        ),
                    ))
                }
            }
            Multiplicity::Counts(counts) => {
                let min = counts.iter().next().copied().unwrap_or_default();
                let max = counts.iter().next_back().copied().unwrap_or_default();
                let n = args.len();
                if self.count_ok(n) {
                    return Ok(args);
                }
                if n < min {
                    Err(DaqError::config(
                        device,
                        format!("not enough devices ({n}<{min}) for '{aname}' in configuration"),
                    ))
                } else if n > max {
                    Err(DaqError::config(
                        device,
                        format!("too many devices ({n}>{max}) for '{aname}' in configuration"),
                    ))
                } else {
                    Err(DaqError::config(
                        device,
                        format!("wrong number of devices ({n}) for '{aname}' in configuration"),
                    ))
                }
            }
        }
    }
}

fn configured_names(
    device: &str,
    aname: &str,
    configured: Option<&Value>,
) -> DaqResult<Vec<Option<String>>> {
    let one = |v: &Value| -> DaqResult<Option<String>> {
        match v {
            Value::String(s) if s.is_empty() => Ok(None),
            Value::String(s) => Ok(Some(s.clone())),
            Value::Null => Ok(None),
            other => Err(DaqError::config(
                device,
                format!("'{aname}' should be a device name or a list of names, not {other}"),
            )),
        }
    };

    match configured {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) if s.is_empty() => Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(one).collect(),
        Some(v) => Ok(vec![one(v)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(n: usize) -> Value {
        Value::Array((0..n).map(|i| json!(format!("dev{i}"))).collect())
    }

    #[test]
    fn test_single_required() {
        let spec = AttachSpec::new("the motor", Capability::Moveable);
        assert_eq!(
            spec.resolve("axis", "motor", Some(&json!("m1"))).unwrap(),
            vec![Some("m1".to_string())]
        );
        assert_eq!(spec.resolve("axis", "motor", Some(&names(1))).unwrap().len(), 1);

        let err = spec.resolve("axis", "motor", None).unwrap_err();
        assert!(err.to_string().contains("device misses device 'motor'"));
        assert!(spec.resolve("axis", "motor", Some(&names(2))).is_err());
    }

    #[test]
    fn test_single_optional_yields_absent() {
        let spec = AttachSpec::new("the coder", Capability::Readable).optional();
        assert_eq!(spec.resolve("axis", "coder", None).unwrap(), vec![None]);
    }

    #[test]
    fn test_unlimited() {
        let required = AttachSpec::new("detectors", Capability::Readable).unlimited();
        assert!(required.resolve("d", "dets", None).is_err());
        assert_eq!(required.resolve("d", "dets", Some(&names(5))).unwrap().len(), 5);

        let optional = required.clone().optional();
        assert!(optional.resolve("d", "dets", None).unwrap().is_empty());
    }

    #[test]
    fn test_count_set_optional() {
        let spec = AttachSpec::new("blades", Capability::Moveable)
            .counts([2, 3])
            .unwrap()
            .optional();
        assert_eq!(spec.resolve("slit", "blades", None).unwrap().len(), 0);
        assert!(spec.resolve("slit", "blades", Some(&names(1))).is_err());
        assert_eq!(spec.resolve("slit", "blades", Some(&names(2))).unwrap().len(), 2);
        assert_eq!(spec.resolve("slit", "blades", Some(&names(3))).unwrap().len(), 3);
        let err = spec.resolve("slit", "blades", Some(&names(4))).unwrap_err();
        assert!(err.to_string().contains("too many devices"));
    }

    #[test]
    fn test_exact_count_required() {
        let spec = AttachSpec::new("blades", Capability::Moveable).exactly(4).unwrap();
        assert!(spec.resolve("slit", "blades", None).is_err());
        let err = spec.resolve("slit", "blades", Some(&names(3))).unwrap_err();
        assert!(err.to_string().contains("not enough devices"));
        assert_eq!(spec.resolve("slit", "blades", Some(&names(4))).unwrap().len(), 4);
    }

    #[test]
    fn test_every_outcome_satisfies_policy() {
        let policies = vec![
            AttachSpec::new("a", Capability::Device),
            AttachSpec::new("a", Capability::Device).optional(),
            AttachSpec::new("a", Capability::Device).unlimited(),
            AttachSpec::new("a", Capability::Device).unlimited().optional(),
            AttachSpec::new("a", Capability::Device).counts([1, 3]).unwrap(),
            AttachSpec::new("a", Capability::Device).counts([2, 3]).unwrap().optional(),
        ];
        for policy in &policies {
            for n in 0..6 {
                let configured = if n == 0 { None } else { Some(names(n)) };
                match policy.resolve("dev", "a", configured.as_ref()) {
                    Ok(list) => {
                        let real = list.iter().filter(|e| e.is_some()).count();
                        assert!(policy.count_ok(real), "{policy:?} accepted {n}");
                    }
                    Err(e) => assert!(matches!(e, DaqError::Configuration(_))),
                }
            }
        }
    }

    #[test]
    fn test_null_entries_need_optional_slot() {
        let single = AttachSpec::new("the motor", Capability::Moveable);
        let err = single.resolve("axis", "motor", Some(&json!([null]))).unwrap_err();
        assert!(err.to_string().contains("missing device in configuration for 'motor'"));

        let unlimited = AttachSpec::new("detectors", Capability::Readable).unlimited();
        assert!(unlimited.resolve("d", "dets", Some(&json!(["m1", null]))).is_err());
        assert!(unlimited.resolve("d", "dets", Some(&json!(["m1", ""]))).is_err());

        let optional = single.optional();
        assert_eq!(
            optional.resolve("axis", "motor", Some(&json!([null]))).unwrap(),
            vec![None]
        );
    }

    #[test]
    fn test_empty_count_set_is_programming_error() {
        assert!(matches!(
            AttachSpec::new("a", Capability::Device).counts(Vec::<usize>::new()),
            Err(DaqError::Programming(_))
        ));
    }

    #[test]
    fn test_non_string_names_rejected() {
        let spec = AttachSpec::new("the motor", Capability::Moveable);
        assert!(spec.resolve("axis", "motor", Some(&json!(42))).is_err());
    }
}
