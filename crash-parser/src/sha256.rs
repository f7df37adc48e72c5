// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use sha2::{Digest, Sha256};

pub fn digest(data: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(data.as_ref()))
}

pub fn digest_iter(data: impl IntoIterator<Item = impl AsRef<[u8]>>) -> String {
    let mut ctx = Sha256::new();

    for frame in data {
        ctx.update(frame);
    }

    hex::encode(ctx.finalize())
}
