//! Domain (model) objects shared by the store, the driver and the readers.

use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

pub const DEFAULT_HANDLER_VERSION: &str = "v1";

#[derive(
    Debug, Default, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Default, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct BlockHash(pub String);

/// Identifier the audit log assigns to one database transaction; the undo key.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct TransactionId(pub i64);

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub number: BlockNumber,
    pub hash: BlockHash,
    #[serde(default)]
    pub parent_hash: BlockHash,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The cursor: what the last successfully applied block was.
#[derive(Debug, Clone, Eq, PartialEq, sqlx::FromRow)]
pub struct IndexState {
    pub block_number: BlockNumber,
    pub block_hash: BlockHash,
    pub handler_version_name: String,
    pub is_replay: bool,
}

impl Default for IndexState {
    /// Pre-genesis state of a fresh schema.
    fn default() -> Self {
        IndexState {
            block_number: BlockNumber(0),
            block_hash: BlockHash::default(),
            handler_version_name: DEFAULT_HANDLER_VERSION.to_string(),
            is_replay: false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, sqlx::FromRow)]
pub struct BlockTxRecord {
    pub block_number: BlockNumber,
    #[sqlx(rename = "txid")]
    pub transaction_id: TransactionId,
}

/// Context handed to a block handler alongside the transactional handle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TxContext {
    pub transaction_id: TransactionId,
}

impl IndexState {
    pub fn is_genesis(&self) -> bool {
        self.block_number == BlockNumber(0)
    }
}

impl BlockNumber {
    pub fn checked_prev(self) -> Option<BlockNumber> {
        self.0.checked_sub(1).map(BlockNumber)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockNumber {
    fn from(value: u64) -> Self {
        BlockNumber(value)
    }
}

impl From<&str> for BlockHash {
    fn from(value: &str) -> Self {
        BlockHash(value.to_string())
    }
}

impl Sub<u64> for BlockNumber {
    type Output = BlockNumber;

    fn sub(self, rhs: u64) -> Self::Output {
        BlockNumber(self.0 - rhs)
    }
}

impl Add<u64> for BlockNumber {
    type Output = BlockNumber;

    fn add(self, rhs: u64) -> Self::Output {
        BlockNumber(self.0 + rhs)
    }
}

impl FromStr for BlockNumber {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = s.trim().parse::<u64>()?;
        Ok(BlockNumber(number))
    }
}

// NOTE: sqlx has no u64 support for sqlite, block numbers are stored as i64 and
// rejected on the way in and out when they don't fit.
impl Type<Sqlite> for BlockNumber {
    fn type_info() -> SqliteTypeInfo {
        <i64 as Type<Sqlite>>::type_info()
    }
}

impl Type<Sqlite> for TransactionId {
    fn type_info() -> SqliteTypeInfo {
        <i64 as Type<Sqlite>>::type_info()
    }
}

impl<'r> Decode<'r, Sqlite> for BlockNumber {
    fn decode(v: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let i: i64 = <i64 as Decode<Sqlite>>::decode(v)?;
        if i < 0 {
            return Err("block_number must be >= 0".into());
        }
        Ok(BlockNumber(i as u64))
    }
}

impl<'r> Decode<'r, Sqlite> for TransactionId {
    fn decode(v: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
        let i: i64 = <i64 as Decode<Sqlite>>::decode(v)?;
        Ok(TransactionId(i))
    }
}

impl<'q> Encode<'q, Sqlite> for BlockNumber {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<IsNull, BoxDynError> {
        let v = i64::try_from(self.0)?;
        args.push(SqliteArgumentValue::Int64(v));
        Ok(IsNull::No)
    }
}

impl<'q> Encode<'q, Sqlite> for TransactionId {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<IsNull, BoxDynError> {
        args.push(SqliteArgumentValue::Int64(self.0));
        Ok(IsNull::No)
    }
}
