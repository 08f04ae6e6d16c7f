//! Sender side: serve one file over HTTP and advertise it over DNS-SD until
//! a peer has downloaded it once.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{self, HeaderMap, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use parking_lot::Mutex;
use tokio::fs::File;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zget_core::cipher::{PLAIN_FRAME_LEN, StreamEncryptor};
use zget_core::discovery::{Advertisement, Registration, ServiceRegistry};
use zget_core::wire::{
    self, KEY_EXCHANGE_REQUEST, KEY_EXCHANGE_RESPONSE, content_disposition, decode_key_exchange,
    encode_key_exchange, request_path,
};
use zget_core::{Ciphersuite, ServiceIdentity, ZgetError};

use crate::transfer::{ProgressHook, TransferProgress};

/// What to share and where to listen.
#[derive(Debug, Clone, Default)]
pub struct ShareRequest {
    pub path: PathBuf,
    /// Extra name the file can be fetched under.
    pub alias: Option<String>,
    /// Address to advertise and listen on.  Exclusive with `interface`.
    pub address: Option<IpAddr>,
    /// Interface whose IPv4 address is used.  Exclusive with `address`.
    pub interface: Option<String>,
    /// `0` lets the OS pick.
    pub port: u16,
    /// Give up when nobody downloaded the file in time.  `None` waits
    /// forever.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// A peer received the whole file.
    Downloaded,
    /// The caller stopped sharing before anyone downloaded the file.
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
enum StopReason {
    Downloaded,
    Cancelled,
    TimedOut,
}

/// Publishes files through a [`ServiceRegistry`].
pub struct Sharer<R> {
    registry: R,
}

impl<R: ServiceRegistry> Sharer<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    /// Serves `request.path` until it has been downloaded once, `cancel`
    /// fires or the timeout elapses.
    ///
    /// A download already running when the share is stopped is allowed to
    /// complete.
    ///
    /// # Errors
    ///
    /// - [`ZgetError::InvalidRequest`] for a missing file or conflicting
    ///   address options.
    /// - [`ZgetError::Discovery`] if the service cannot be advertised.
    /// - [`ZgetError::TransferFailed`] if the listener cannot be bound.
    /// - [`ZgetError::ShareTimedOut`] if nobody downloaded the file in time.
    pub async fn share(
        &self,
        request: ShareRequest,
        ciphersuite: Ciphersuite,
        progress: Option<ProgressHook>,
        cancel: &CancellationToken,
    ) -> Result<ShareOutcome, ZgetError> {
        let metadata = tokio::fs::metadata(&request.path).await.map_err(|e| {
            ZgetError::InvalidRequest(format!("cannot read {}: {e}", request.path.display()))
        })?;
        if !metadata.is_file() {
            return Err(ZgetError::InvalidRequest(format!(
                "{} is not a regular file",
                request.path.display()
            )));
        }
        let name = request
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ZgetError::InvalidRequest(format!("{} has no file name", request.path.display()))
            })?;

        let ip = resolve_address(request.address, request.interface.as_deref())?;
        let listener = TcpListener::bind((ip, request.port))
            .await
            .with_context(|| format!("failed to bind {ip}:{}", request.port))
            .map_err(ZgetError::TransferFailed)?;
        let local = listener
            .local_addr()
            .context("failed to read bound address")
            .map_err(ZgetError::TransferFailed)?;

        let mut names = vec![name.clone()];
        if let Some(alias) = request.alias.as_deref() {
            if alias != name {
                names.push(alias.to_owned());
            }
        }

        let state = Arc::new(ShareState {
            path: request.path.clone(),
            basename: name,
            routes: names.iter().map(|n| request_path(n)).collect(),
            ciphersuite,
            progress: Mutex::new(progress),
            downloaded: CancellationToken::new(),
        });

        let registrations = self.advertise(&names, local)?;

        let app = Router::new()
            .fallback(serve_file)
            .with_state(Arc::clone(&state));
        let stop = CancellationToken::new();
        let server = {
            let shutdown = stop.clone();
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
            })
        };
        info!(addr = %local, path = %request.path.display(), "Sharing");

        let reason = tokio::select! {
            () = state.downloaded.cancelled() => StopReason::Downloaded,
            () = cancel.cancelled() => StopReason::Cancelled,
            () = wait_for(request.timeout) => StopReason::TimedOut,
        };
        debug!(?reason, "Stopping share");

        for registration in registrations {
            registration.withdraw();
        }
        stop.cancel();
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "HTTP server stopped with an error"),
            Err(e) => warn!(error = %e, "HTTP server task failed"),
        }

        if state.downloaded.is_cancelled() {
            info!("Done.");
            return Ok(ShareOutcome::Downloaded);
        }
        match reason {
            StopReason::TimedOut => Err(ZgetError::ShareTimedOut {
                timeout: request.timeout.unwrap_or_default(),
            }),
            StopReason::Cancelled | StopReason::Downloaded => {
                info!("Sharing cancelled");
                Ok(ShareOutcome::Cancelled)
            }
        }
    }

    fn advertise(
        &self,
        names: &[String],
        addr: SocketAddr,
    ) -> Result<Vec<R::Registration>, ZgetError> {
        let mut registrations = Vec::with_capacity(names.len());
        for name in names {
            let advert = Advertisement {
                identity: ServiceIdentity::derive(name),
                addr,
            };
            match self.registry.register(&advert) {
                Ok(registration) => registrations.push(registration),
                Err(e) => {
                    for registration in registrations {
                        registration.withdraw();
                    }
                    return Err(ZgetError::Discovery(e));
                }
            }
        }
        Ok(registrations)
    }
}

async fn wait_for(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// Picks the address to listen on and advertise.
///
/// # Errors
///
/// [`ZgetError::InvalidRequest`] when both options are set or the interface
/// has no IPv4 address, [`ZgetError::Discovery`] when no local address can
/// be determined.
pub fn resolve_address(
    address: Option<IpAddr>,
    interface: Option<&str>,
) -> Result<IpAddr, ZgetError> {
    match (address, interface) {
        (Some(_), Some(_)) => Err(ZgetError::InvalidRequest(
            "an address and an interface cannot both be given".into(),
        )),
        (Some(address), None) => Ok(address),
        (None, Some(name)) => local_ip_address::list_afinet_netifas()
            .context("failed to list network interfaces")
            .map_err(ZgetError::Discovery)?
            .into_iter()
            .find(|(iface, ip)| iface == name && ip.is_ipv4())
            .map(|(_, ip)| ip)
            .ok_or_else(|| {
                ZgetError::InvalidRequest(format!("interface {name} has no IPv4 address"))
            }),
        (None, None) => local_ip_address::local_ip()
            .context("failed to determine a local IP address")
            .map_err(ZgetError::Discovery),
    }
}

// ── HTTP handler ────────────────────────────────────────────────────

struct ShareState {
    path: PathBuf,
    basename: String,
    /// Encoded request paths this share answers.
    routes: Vec<String>,
    ciphersuite: Ciphersuite,
    progress: Mutex<Option<ProgressHook>>,
    /// Fired once the last byte of a response body was handed out.
    downloaded: CancellationToken,
}

impl ShareState {
    fn report(&self, progress: &TransferProgress) {
        if let Some(hook) = self.progress.lock().as_mut() {
            hook(progress);
        }
    }
}

async fn serve_file(
    State(share): State<Arc<ShareState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path();
    if !share.routes.iter().any(|route| route == path) {
        warn!(path = %path, "Invalid request received");
        return StatusCode::NOT_FOUND.into_response();
    }

    let exchange = match share.ciphersuite.start() {
        Ok(exchange) => exchange,
        Err(e) => {
            warn!(error = %e, "Cannot start key exchange");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let inbound = match headers
        .get(KEY_EXCHANGE_REQUEST)
        .map(|value| decode_key_exchange(value.as_bytes()))
        .transpose()
    {
        Ok(inbound) => inbound,
        Err(e) => {
            warn!(error = %e, "Malformed key exchange");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    let outbound = exchange.outbound().map(encode_key_exchange);
    let cipher = match exchange.finish(inbound.as_deref()) {
        Ok(cipher) => cipher,
        Err(e) => {
            warn!(error = %e, "Key exchange failed");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let file = match File::open(&share.path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %share.path.display(), error = %e, "Cannot open shared file");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let size = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            warn!(error = %e, "Cannot stat shared file");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let wire_len = cipher.sealed_len(size);
    info!(bytes = size, "Peer found. Uploading...");
    if wire_len == 0 {
        // An empty body is never polled.
        share.downloaded.cancel();
    }

    let upload = Upload {
        reader: ReaderStream::with_capacity(file, PLAIN_FRAME_LEN),
        encryptor: Some(cipher.encryptor()),
        share: Arc::clone(&share),
        chunk_index: 0,
        sent: 0,
        total: wire_len,
    };

    let mut response = http::Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, wire::CONTENT_TYPE)
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(&share.basename),
        )
        .header(header::CONTENT_LENGTH, wire_len);
    if let Some(outbound) = outbound {
        response = response.header(KEY_EXCHANGE_RESPONSE, outbound);
    }
    match response.body(Body::from_stream(sealed_body(upload))) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Cannot build response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ── Sealed body ─────────────────────────────────────────────────────

struct Upload {
    reader: ReaderStream<File>,
    /// `None` once the stream has ended or failed.
    encryptor: Option<StreamEncryptor>,
    share: Arc<ShareState>,
    chunk_index: u64,
    sent: u64,
    total: u64,
}

impl Upload {
    fn sent(&mut self, len: usize) {
        self.sent += len as u64;
        self.share.report(&TransferProgress {
            chunk_index: self.chunk_index,
            bytes_so_far: self.sent,
            total_bytes: Some(self.total),
        });
        self.chunk_index += 1;
        // The HTTP stack stops polling once `Content-Length` bytes are out,
        // so the end of the file may never be observed.
        if self.sent >= self.total {
            self.share.downloaded.cancel();
        }
    }
}

fn sealed_body(upload: Upload) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::unfold(upload, |mut upload| async move {
        loop {
            let encryptor = upload.encryptor.as_mut()?;
            match upload.reader.next().await {
                Some(Ok(data)) => match encryptor.update(&data) {
                    Ok(sealed) if sealed.is_empty() => {}
                    Ok(sealed) => {
                        upload.sent(sealed.len());
                        return Some((Ok(Bytes::from(sealed)), upload));
                    }
                    Err(e) => {
                        upload.encryptor = None;
                        return Some((Err(io::Error::other(e)), upload));
                    }
                },
                Some(Err(e)) => {
                    upload.encryptor = None;
                    return Some((Err(e), upload));
                }
                None => {
                    let encryptor = upload.encryptor.take()?;
                    return match encryptor.finish() {
                        Ok(tail) => {
                            upload.sent(tail.len());
                            upload.share.downloaded.cancel();
                            Some((Ok(Bytes::from(tail)), upload))
                        }
                        Err(e) => Some((Err(io::Error::other(e)), upload)),
                    };
                }
            }
        }
    })
}
