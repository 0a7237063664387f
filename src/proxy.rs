//! HTTP forwarding pipeline with request/response callback chains.
//!
//! Each service owns one [`ReverseProxy`]. A request walks the `on_request`
//! callbacks, is forwarded to the first backend that dials (dial failures
//! are retried against the next address, nothing is ever re-sent once the
//! request starts flowing), then walks the `on_response` callbacks which may
//! replace the response before it streams back.

use crate::error::{json_error_response, ProxyBody, ProxyError, ProxyErrorCode};
use crate::errorpage::ErrorPages;
use crate::service::Service;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HOST, LOCATION, USER_AGENT};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Hop-by-hop headers stripped from forwarded requests and responses.
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-request record threaded through the callback chain.
pub struct ProxyRequest {
    /// Inbound request; taken when it is forwarded upstream.
    pub request: Option<Request<Incoming>>,
    /// Upstream response; taken when streamed or substituted.
    pub response: Option<Response<Incoming>>,
    /// Candidate backend addresses in balancing order.
    pub addrs: Vec<String>,
    /// Address of the backend that produced `response`.
    pub backend_addr: Option<String>,
    pub client_addr: SocketAddr,
    pub start: Instant,
    pub finish: Option<Instant>,
    /// Terminal transport failure, if any.
    pub error: Option<ProxyError>,

    // metadata captured up front so logging works after the request moves
    pub request_id: String,
    pub method: Method,
    pub host: String,
    pub uri: String,
    pub user_agent: String,
    pub forwarded_for: Option<String>,
}

impl ProxyRequest {
    pub fn new(req: Request<Incoming>, addrs: Vec<String>, client_addr: SocketAddr) -> ProxyRequest {
        fn header<B>(req: &Request<B>, name: &str) -> String {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        }

        let request_id = header(&req, "x-request-id");
        let host = header(&req, HOST.as_str());
        let user_agent = header(&req, USER_AGENT.as_str());
        let forwarded_for = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let method = req.method().clone();
        let uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        ProxyRequest {
            request: Some(req),
            response: None,
            addrs,
            backend_addr: None,
            client_addr,
            start: Instant::now(),
            finish: None,
            error: None,
            request_id,
            method,
            host,
            uri,
            user_agent,
            forwarded_for,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|r| r.status())
    }

    pub fn duration(&self) -> Duration {
        self.finish.unwrap_or_else(Instant::now) - self.start
    }
}

/// What a callback decided for the request.
pub enum CallbackAction {
    /// Continue down the chain.
    Continue,
    /// Stop and answer the client with this response.
    Respond(Response<ProxyBody>),
}

/// One link in a request or response callback chain.
pub trait Callback: Send + Sync {
    fn call<'a>(&'a self, pr: &'a mut ProxyRequest) -> BoxFuture<'a, CallbackAction>;
}

pub struct ReverseProxy {
    on_request: Vec<Box<dyn Callback>>,
    on_response: Vec<Box<dyn Callback>>,
}

impl ReverseProxy {
    pub fn new(
        on_request: Vec<Box<dyn Callback>>,
        on_response: Vec<Box<dyn Callback>>,
    ) -> ReverseProxy {
        ReverseProxy {
            on_request,
            on_response,
        }
    }

    /// Run one request through the pipeline. The response callbacks always
    /// run, with `ProxyRequest::error` populated on terminal failures, so
    /// the access log sees every forwarded request.
    pub async fn serve(
        &self,
        service: &Arc<Service>,
        req: Request<Incoming>,
        addrs: Vec<String>,
        client_addr: SocketAddr,
    ) -> Response<ProxyBody> {
        let mut pr = ProxyRequest::new(req, addrs, client_addr);

        for callback in &self.on_request {
            if let CallbackAction::Respond(resp) = callback.call(&mut pr).await {
                return resp;
            }
        }

        match self.round_trip(service, &mut pr).await {
            Ok(resp) => pr.response = Some(resp),
            Err(err) => pr.error = Some(err),
        }
        pr.finish = Some(Instant::now());

        for callback in &self.on_response {
            if let CallbackAction::Respond(resp) = callback.call(&mut pr).await {
                return resp;
            }
        }

        match pr.response.take() {
            Some(mut resp) => {
                strip_hop_headers(resp.headers_mut());
                resp.map(|body| body.boxed())
            }
            None => {
                let code = pr
                    .error
                    .as_ref()
                    .map(ProxyErrorCode::from)
                    .unwrap_or(ProxyErrorCode::NoBackendAvailable);
                let message = pr
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no backend available".to_string());
                json_error_response(code, message)
            }
        }
    }

    /// Walk the candidate addresses until one dials, then send the request
    /// on that connection. Only dial-phase failures advance to the next
    /// address.
    async fn round_trip(
        &self,
        service: &Arc<Service>,
        pr: &mut ProxyRequest,
    ) -> Result<Response<Incoming>, ProxyError> {
        let Some(mut req) = pr.request.take() else {
            return Err(ProxyError::NoBackends(None));
        };
        strip_hop_headers(req.headers_mut());
        *req.uri_mut() = origin_form(&pr.uri);

        let addrs = pr.addrs.clone();
        let mut last_err = None;
        for addr in &addrs {
            match service.dial(addr).await {
                Ok(conn) => {
                    pr.backend_addr = Some(addr.clone());
                    let io = TokioIo::new(conn);
                    let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
                        .await
                        .map_err(ProxyError::Upstream)?;
                    tokio::spawn(async move {
                        if let Err(err) = connection.await {
                            debug!(error = %err, "upstream connection error");
                        }
                    });
                    return sender.send_request(req).await.map_err(ProxyError::Upstream);
                }
                Err(err) => {
                    debug!(addr = %addr, error = %err, "dial failed, trying next backend");
                    last_err = Some(err);
                }
            }
        }
        Err(ProxyError::NoBackends(last_err))
    }
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

fn origin_form(path_and_query: &str) -> Uri {
    path_and_query
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

/// 301 to the https scheme when the process only serves SSL clients.
pub struct SslRedirect {
    pub ssl_only: bool,
}

impl Callback for SslRedirect {
    fn call<'a>(&'a self, pr: &'a mut ProxyRequest) -> BoxFuture<'a, CallbackAction> {
        Box::pin(async move {
            if !self.ssl_only {
                return CallbackAction::Continue;
            }
            let proto = pr
                .request
                .as_ref()
                .and_then(|r| r.headers().get("x-forwarded-proto"))
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if proto == "https" {
                return CallbackAction::Continue;
            }

            let location = format!("https://{}{}", pr.host, pr.uri);
            let resp = Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(LOCATION, location)
                .body(
                    Empty::<Bytes>::new()
                        .map_err(|never| match never {})
                        .boxed(),
                )
                .expect("valid redirect response");
            CallbackAction::Respond(resp)
        })
    }
}

/// Access log line for every forwarded request.
pub struct LogRequest;

impl Callback for LogRequest {
    fn call<'a>(&'a self, pr: &'a mut ProxyRequest) -> BoxFuture<'a, CallbackAction> {
        Box::pin(async move {
            let client_ip = pr
                .forwarded_for
                .clone()
                .unwrap_or_else(|| pr.client_addr.to_string());
            let status = pr
                .status()
                .unwrap_or(StatusCode::BAD_GATEWAY)
                .as_u16();
            let err = pr
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            info!(
                id = %pr.request_id,
                method = %pr.method,
                client_ip = %client_ip,
                url = %format!("{}{}", pr.host, pr.uri),
                backend = pr.backend_addr.as_deref().unwrap_or(""),
                status,
                duration = ?pr.duration(),
                agent = %pr.user_agent,
                err = %err,
                "request"
            );
            CallbackAction::Continue
        })
    }
}

/// Count terminal proxy failures on the owning service.
pub struct ErrStats {
    pub service: Weak<Service>,
}

impl Callback for ErrStats {
    fn call<'a>(&'a self, pr: &'a mut ProxyRequest) -> BoxFuture<'a, CallbackAction> {
        Box::pin(async move {
            if pr.error.is_some() {
                if let Some(service) = self.service.upgrade() {
                    service.record_http_error();
                }
            }
            CallbackAction::Continue
        })
    }
}

/// Substitute a cached error page when the upstream status has one.
pub struct ErrorPageCheck {
    pub pages: Arc<ErrorPages>,
}

impl Callback for ErrorPageCheck {
    fn call<'a>(&'a self, pr: &'a mut ProxyRequest) -> BoxFuture<'a, CallbackAction> {
        Box::pin(async move {
            let Some(status) = pr.status() else {
                return CallbackAction::Continue;
            };
            match self.pages.check_response(status).await {
                Some(resp) => CallbackAction::Respond(resp),
                None => CallbackAction::Continue,
            }
        })
    }
}
