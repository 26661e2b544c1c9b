//! HTTP 辅助工具：客户端地址、请求 span、安全头与局域网地址探测。

use axum::body::Body as AxumBody;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::{middleware, response::Response};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{Span, info_span};

/// Any routable address works; the socket is only connected, never sent on.
const PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

/// 以连接对端地址作为客户端标识，IPv4 映射地址还原为 IPv4。
///
/// Forwarding headers are ignored: the service is reached directly on the
/// LAN and a client-supplied header would let it dodge its own block.
pub fn client_ip(addr: SocketAddr) -> IpAddr {
    addr.ip().to_canonical()
}

/// 为每个请求创建携带客户端地址的 tracing span。
pub fn make_request_span<B>(request: &Request<B>) -> Span {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| client_ip(*addr).to_string())
        .unwrap_or_else(|| "unknown".to_string());

    info_span!(
        env!("CARGO_CRATE_NAME"),
        client_ip,
        method = ?request.method(),
        path = ?request.uri().path(),
    )
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

/// 探测本机在局域网中的地址，用于展示连接 URL。
pub async fn discover_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect(PROBE_ADDR).await.ok()?;
    let local = socket.local_addr().ok()?.ip();
    (!local.is_unspecified()).then_some(local)
}

/// 生成展示给其他设备的连接地址。
pub fn connect_url(bind_ip: IpAddr, lan_ip: Option<IpAddr>, port: u16) -> String {
    let host = if bind_ip.is_unspecified() {
        lan_ip.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        bind_ip
    };
    format!("http://{}", SocketAddr::new(host, port))
}
