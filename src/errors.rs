// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::types::ResourceId;
use std::error::Error;
use thiserror::Error as DeriveError;

#[derive(Debug, DeriveError)]
pub enum TxError {
    #[error("no transaction is active in the calling context")]
    NoActiveTransaction,

    #[error("a transaction is already active in the calling context")]
    AlreadyActive,

    #[error("transaction was aborted to break a deadlock")]
    Aborted,

    #[error("unknown resource id ({0})")]
    UnknownResource(ResourceId),

    #[error("resource operation failed: {0}")]
    OperationFailed(Box<dyn Error + Send + Sync>),

    #[error("wait was cancelled from outside the transaction")]
    Cancelled,
}
