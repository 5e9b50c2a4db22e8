use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, StrandError};

/// Scope holding system variables (query, files, user id, ...).
pub const SYSTEM_SCOPE: &str = "sys";
/// Scope holding environment variables seeded before the run.
pub const ENVIRONMENT_SCOPE: &str = "env";
/// Scope holding conversation variables seeded before the run.
pub const CONVERSATION_SCOPE: &str = "conversation";

pub const RESERVED_SCOPES: [&str; 3] = [SYSTEM_SCOPE, ENVIRONMENT_SCOPE, CONVERSATION_SCOPE];

/// Address of a segment: owning node id (or reserved scope) then a path.
///
/// Serialized as a flat array, e.g. `["llm_1", "text"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Selector {
    pub node_id: String,
    pub path: Vec<String>,
}

impl Selector {
    pub fn new(node_id: impl Into<String>, path: &[&str]) -> Self {
        Self {
            node_id: node_id.into(),
            path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_parts<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = parts.into_iter().map(Into::into);
        let node_id = parts
            .next()
            .filter(|s: &String| !s.is_empty())
            .ok_or_else(|| StrandError::InvalidSelector("empty selector".into()))?;
        let path: Vec<String> = parts.collect();
        if path.is_empty() {
            return Err(StrandError::InvalidSelector(format!(
                "selector {node_id} has no variable name"
            )));
        }
        Ok(Self { node_id, path })
    }

    /// Parse the dotted form used inside templates: `node.var.key`.
    pub fn parse_dotted(s: &str) -> Result<Self> {
        Self::from_parts(s.split('.'))
    }

    pub fn system(name: &str) -> Self {
        Self::new(SYSTEM_SCOPE, &[name])
    }

    pub fn is_reserved(&self) -> bool {
        RESERVED_SCOPES.contains(&self.node_id.as_str())
    }

    /// The top-level variable name, i.e. the first path element.
    pub fn variable(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }

    /// Key of the stored variable (node id + first path element).
    pub(crate) fn storage_key(&self) -> (String, String) {
        (self.node_id.clone(), self.variable().to_string())
    }

    /// Path below the stored variable.
    pub(crate) fn nested_path(&self) -> &[String] {
        self.path.get(1..).unwrap_or_default()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_id)?;
        for p in &self.path {
            write!(f, ".{p}")?;
        }
        Ok(())
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.path.len() + 1))?;
        seq.serialize_element(&self.node_id)?;
        for p in &self.path {
            seq.serialize_element(p)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SelectorVisitor;

        impl<'de> Visitor<'de> for SelectorVisitor {
            type Value = Selector;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a selector array like [\"node\", \"var\"] or a dotted string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Selector, E> {
                Selector::parse_dotted(v).map_err(E::custom)
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Selector, A::Error> {
                let mut parts: Vec<String> = Vec::new();
                while let Some(part) = seq.next_element::<String>()? {
                    parts.push(part);
                }
                Selector::from_parts(parts).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(SelectorVisitor)
    }
}
