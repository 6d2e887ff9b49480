use crate::error::{IndexError, IndexResult};
use std::fmt;

pub const INDEX_STATE_TABLE: &str = "_index_state";
pub const BLOCK_TX_TABLE: &str = "_block_number_txid";

/// A validated sqlite database name (`main` or an attached alias) that every
/// table access is qualified with.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Schema {
    name: String,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> IndexResult<Self> {
        let name = name.into();
        validate_identifier(&name)?;
        Ok(Schema { name })
    }

    pub fn main() -> Self {
        Schema {
            name: "main".to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fully qualified `"schema"."table"`.
    pub fn table(&self, table: &str) -> IndexResult<String> {
        validate_identifier(table)?;
        Ok(self.qualified(table))
    }

    pub(crate) fn index_state(&self) -> String {
        self.qualified(INDEX_STATE_TABLE)
    }

    pub(crate) fn block_tx(&self) -> String {
        self.qualified(BLOCK_TX_TABLE)
    }

    pub(crate) fn qualified(&self, table: &str) -> String {
        format!("\"{}\".\"{}\"", self.name, table)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identifiers end up spliced into sql text, only plain ascii names are allowed.
pub fn validate_identifier(name: &str) -> IndexResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(IndexError::InvalidIdentifier(name.to_string()))
    }
}
