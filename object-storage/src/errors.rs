// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStorageError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("upload limit exceeded")]
    UploadLimit,

    #[error("upload cancelled")]
    Cancelled,

    #[error("object storage request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("object storage request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request signing failed: {0}")]
    Sign(#[from] aws_auth::SignError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ObjectStorageError>;
