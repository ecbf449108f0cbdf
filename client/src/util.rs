// Copyright 2025-2026 Maurice S. Barnum
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::time::Duration;

use base64::Engine as _;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Error;
use crate::Result;

pub(crate) async fn with_timeout<T, Fut>(timeout: Option<Duration>, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(Error::from_tokio_elapsed)?,
        None => fut.await,
    }
}

// Tokens handed to callers (continuations, checkpoints) are `<tag>.<base64url json>`.  The tag
// versions the payload; the encoding keeps them opaque and safe to pass around as text.

pub(crate) fn encode_token<T: Serialize>(tag: &str, value: &T) -> serde_json::Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(format!("{tag}.{}", BASE64_URL_SAFE_NO_PAD.encode(json)))
}

pub(crate) fn decode_token<T: DeserializeOwned>(s: &str, what: &str, tag: &str) -> Result<T> {
    let payload = s
        .strip_prefix(tag)
        .and_then(|rest| rest.strip_prefix('.'))
        .ok_or_else(|| Error::Malformed(format!("invalid {what}: expected a {tag} token")))?;
    let json = BASE64_URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| Error::Malformed(format!("invalid {what}: {e}")))?;
    serde_json::from_slice(&json).map_err(|e| Error::Malformed(format!("invalid {what}: {e}")))
}
