//! Per-attempt transaction resolution.
//!
//! Turns the static [`TransactionTemplate`] into the concrete function,
//! arguments and transient map of one attempt.

use std::{collections::BTreeMap, fmt};

use base64::Engine as _;
use rand::RngExt as _;
use serde_json::Value;

use crate::workload::{
    ConfigError, InvokeKind, TransactionTemplate, TransientFieldKind, TransientTemplate,
};


/// The tuple that makes keys unique across concurrently running workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyScope {
    pub channel: String,
    pub org: String,
    pub run_id: String,
    pub worker: String,
}

impl fmt::Display for KeyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.channel, self.org, self.run_id, self.worker
        )
    }
}

/// A fully resolved attempt, ready to be handed to a ledger client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxSpec {
    pub kind: InvokeKind,
    pub seq: u64,
    /// Unique token of this attempt, `{scope}_{key_start + seq}`.
    pub key: String,
    pub function: String,
    pub args: Vec<String>,
    /// Transient map entries, JSON then base64 encoded (MOVE only).
    pub transient: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct TxSpecResolver {
    template: TransactionTemplate,
    prefix: String,
}

impl TxSpecResolver {
    /// Create a resolver for the given kinds, failing if any configured
    /// argument index does not fit the matching template.
    pub fn try_new(
        template: TransactionTemplate,
        scope: &KeyScope,
        kinds: &[InvokeKind],
    ) -> Result<Self, ConfigError> {
        for kind in kinds {
            template.check_indices(*kind)?;
        }
        Ok(Self {
            template,
            prefix: scope.to_string(),
        })
    }

    /// Key token of attempt `seq`.
    pub fn key(&self, seq: u64) -> String {
        format!("{}_{}", self.prefix, self.key_id(seq))
    }

    fn key_id(&self, seq: u64) -> u64 {
        self.template.key_start.saturating_add(seq)
    }

    pub fn resolve(&self, seq: u64, kind: InvokeKind) -> Result<TxSpec, ConfigError> {
        self.template.check_indices(kind)?;

        let function = self.template.function(kind);
        let key = self.key(seq);

        let mut args = function.args.clone();
        for &idx in &self.template.key_idx {
            args[idx].push_str(&key);
        }

        let mut transient = None;
        if kind == InvokeKind::Move {
            for &idx in &self.template.payload_idx {
                args[idx] = random_payload(self.template.payload.min, self.template.payload.max);
            }
            if let Some(template) = &self.template.transient {
                transient = Some(resolve_transient(template, &key, self.key_id(seq)));
            }
        }

        Ok(TxSpec {
            kind,
            seq,
            key,
            function: function.fcn.clone(),
            args,
            transient,
        })
    }
}

/// Hex encoded random bytes, byte length uniform in `[min, max]`.
fn random_payload(min: usize, max: usize) -> String {
    let mut rng = rand::rng();
    let len = if max > min {
        rng.random_range(min..=max)
    } else {
        min
    };
    let bytes: Vec<u8> = (0..len).map(|_| rng.random::<u8>()).collect();
    hex::encode(bytes)
}

fn resolve_transient(
    template: &TransientTemplate,
    key: &str,
    key_id: u64,
) -> BTreeMap<String, String> {
    template
        .map
        .iter()
        .map(|(name, entry)| {
            let mut entry = entry.clone();
            if template.keys.is_empty() || template.keys.iter().any(|k| k == name) {
                for field in &template.fields {
                    let Some(value) = entry.get_mut(&field.name) else {
                        continue;
                    };
                    *value = match field.kind {
                        TransientFieldKind::String => {
                            let base = match value {
                                Value::String(s) => s.clone(),
                                ref other => other.to_string(),
                            };
                            Value::String(format!("{base}{key}"))
                        }
                        TransientFieldKind::Integer => Value::from(key_id),
                    };
                }
            }
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(Value::Object(entry).to_string());
            (name.clone(), encoded)
        })
        .collect()
}
