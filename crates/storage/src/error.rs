// Copyright 2022 Kestrel Foundation. All rights reserved.
// Kestrel is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use kestrel_types::BlockNumber;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("attempt to mutate a read-only storage layer")]
    ReadOnly,

    #[error("rollback entry not found: {table}:{key}")]
    Rollback { table: String, key: String },

    #[error("block {0} is not prepared")]
    NotPrepared(BlockNumber),

    #[error("block {requested} does not match prepared block {prepared}")]
    PreparedMismatch {
        requested: BlockNumber,
        prepared: BlockNumber,
    },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<String> for Error {
    fn from(e: String) -> Self { Error::Msg(e) }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self { Error::Msg(e.into()) }
}
