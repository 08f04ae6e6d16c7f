use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use futures::StreamExt;
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use zget_core::fs::PartialFile;
use zget_core::identity::basename;
use zget_core::wire::{
    KEY_EXCHANGE_REQUEST, KEY_EXCHANGE_RESPONSE, decode_key_exchange, encode_key_exchange,
    request_path,
};
use zget_core::{CipherError, Ciphersuite, ZgetError};

/// Progress of a running transfer, reported once per received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Zero-based index of the chunk just handled.
    pub chunk_index: u64,
    /// Bytes moved over the wire so far, sealing overhead included.
    pub bytes_so_far: u64,
    /// Wire size announced by the sender, when known.
    pub total_bytes: Option<u64>,
}

/// Boxed progress callback as stored by the orchestrator and the sharer.
pub type ProgressHook = Box<dyn FnMut(&TransferProgress) + Send>;

/// HTTP side of a receive: request, key exchange, decrypt, write.
pub struct TransferClient {
    http: reqwest::Client,
}

impl TransferClient {
    /// Builds the HTTP client.  Proxies are ignored since peers are always
    /// on the local network.
    ///
    /// # Errors
    ///
    /// Returns [`ZgetError::TransferFailed`] if the client cannot be built.
    pub fn new() -> Result<Self, ZgetError> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("failed to build HTTP client")
            .map_err(ZgetError::TransferFailed)?;
        Ok(Self { http })
    }

    /// Downloads `filename` from `peer` into `destination`, or into the
    /// basename of `filename` in the working directory.
    ///
    /// Nothing appears at the destination unless the whole stream was
    /// received and authenticated.
    ///
    /// # Errors
    ///
    /// - [`ZgetError::AuthenticationFailed`] when the key exchange or any
    ///   frame fails to verify, or the sender rejected our exchange.
    /// - [`ZgetError::TransferFailed`] on network, HTTP or disk failures.
    /// - [`ZgetError::InvalidRequest`] when no destination can be derived.
    pub async fn fetch(
        &self,
        peer: SocketAddr,
        filename: &str,
        destination: Option<&Path>,
        ciphersuite: &Ciphersuite,
        mut progress: Option<&mut (dyn FnMut(&TransferProgress) + Send + 'static)>,
    ) -> Result<PathBuf, ZgetError> {
        let dest = match destination {
            Some(path) => path.to_path_buf(),
            None => default_destination(filename)?,
        };

        let exchange = ciphersuite.start()?;
        let url = resource_url(peer, filename);
        let mut request = self.http.get(&url);
        if let Some(message) = exchange.outbound() {
            request = request.header(KEY_EXCHANGE_REQUEST, encode_key_exchange(message));
        }

        info!(url = %url, "Downloading");
        let response = request
            .send()
            .await
            .with_context(|| format!("failed to request {url}"))
            .map_err(ZgetError::TransferFailed)?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                warn!(peer = %peer, "Peer rejected the key exchange");
                return Err(ZgetError::AuthenticationFailed(CipherError::KeyExchange(
                    "peer rejected the key exchange".into(),
                )));
            }
            status => {
                return Err(ZgetError::TransferFailed(anyhow!(
                    "peer answered {status} for {url}"
                )));
            }
        }

        let inbound = response
            .headers()
            .get(KEY_EXCHANGE_RESPONSE)
            .map(|value| decode_key_exchange(value.as_bytes()))
            .transpose()
            .map_err(|e| ZgetError::AuthenticationFailed(CipherError::KeyExchange(e.to_string())))?;
        let cipher = exchange.finish(inbound.as_deref())?;

        let total_bytes = response.content_length();
        debug!(?total_bytes, dest = %dest.display(), "Receiving");

        let mut output = PartialFile::create(&dest)
            .with_context(|| format!("cannot write to {}", dest.display()))
            .map_err(ZgetError::TransferFailed)?;
        let mut decryptor = cipher.decryptor();
        let mut body = response.bytes_stream();
        let mut bytes_so_far = 0u64;
        let mut chunk_index = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk
                .context("connection to peer failed")
                .map_err(ZgetError::TransferFailed)?;
            let plain = decryptor.update(&chunk)?;
            output
                .write(&plain)
                .await
                .with_context(|| format!("failed to write {}", dest.display()))
                .map_err(ZgetError::TransferFailed)?;

            bytes_so_far += chunk.len() as u64;
            if let Some(hook) = progress.as_deref_mut() {
                hook(&TransferProgress {
                    chunk_index,
                    bytes_so_far,
                    total_bytes,
                });
            }
            chunk_index += 1;
        }

        if let Some(expected) = total_bytes {
            if bytes_so_far != expected {
                return Err(ZgetError::TransferFailed(anyhow!(
                    "stream ended after {bytes_so_far} of {expected} bytes"
                )));
            }
        }

        let tail = decryptor.finish()?;
        output
            .write(&tail)
            .await
            .with_context(|| format!("failed to write {}", dest.display()))
            .map_err(ZgetError::TransferFailed)?;
        let path = output
            .commit()
            .await
            .with_context(|| format!("failed to move download into {}", dest.display()))
            .map_err(ZgetError::TransferFailed)?;

        info!(path = %path.display(), bytes = bytes_so_far, "Download complete");
        Ok(path)
    }
}

/// `http://<addr>:<port>/<encoded filename>`.
#[must_use]
pub fn resource_url(peer: SocketAddr, filename: &str) -> String {
    format!("http://{peer}{}", request_path(filename))
}

/// Where a download lands when the caller gave no output path.
///
/// # Errors
///
/// [`ZgetError::InvalidRequest`] if `filename` has an empty basename.
pub fn default_destination(filename: &str) -> Result<PathBuf, ZgetError> {
    let name = basename(filename);
    if name.is_empty() || name == "." || name == ".." {
        return Err(ZgetError::InvalidRequest(format!(
            "cannot derive an output file name from {filename:?}"
        )));
    }
    Ok(PathBuf::from(name))
}
