#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

/// Readiness latch flipped once the store is migrated and the QUIC endpoint
/// is listening.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = serve(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn serve(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_probe(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_probe(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let reply = match (req.method(), req.uri().path()) {
		(&Method::GET, "/healthz") => (StatusCode::OK, Bytes::from_static(b"ok")),
		(&Method::GET, "/readyz") if state.is_ready() => (StatusCode::OK, Bytes::from_static(b"ready")),
		(&Method::GET, "/readyz") => (StatusCode::SERVICE_UNAVAILABLE, Bytes::from_static(b"not-ready")),
		(&Method::GET, _) => (StatusCode::NOT_FOUND, Bytes::new()),
		_ => (StatusCode::METHOD_NOT_ALLOWED, Bytes::new()),
	};

	let (status, body) = reply;
	let response = Response::builder().status(status).body(Full::new(body));
	match response {
		Ok(response) => Ok(response),
		// Statically-built responses cannot fail; fall back to an empty 500.
		Err(_) => Ok(Response::new(Full::new(Bytes::new()))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn readiness_latch_starts_down() {
		let state = HealthState::new();
		assert!(!state.is_ready());
		state.mark_ready();
		assert!(state.is_ready());
	}
}
