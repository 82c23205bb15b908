use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use url::Url;

/// Text frames from one open connection; the stream ends when the
/// connection closes.
pub type FrameStream = BoxStream<'static, Result<String, InfraError>>;

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn open(&self, url: &str) -> Result<FrameStream, InfraError>;
}

#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    cookies: Option<Arc<Jar>>,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookies(mut self, cookies: Arc<Jar>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    fn cookie_header(&self, url: &str) -> Option<HeaderValue> {
        let jar = self.cookies.as_ref()?;
        let mut lookup = Url::parse(url).ok()?;
        let http_scheme = match lookup.scheme() {
            "wss" => "https",
            "ws" => "http",
            _ => return None,
        };
        lookup.set_scheme(http_scheme).ok()?;
        let value = jar.cookies(&lookup)?;
        HeaderValue::from_bytes(value.as_bytes()).ok()
    }
}

#[async_trait]
impl PushConnector for TungsteniteConnector {
    async fn open(&self, url: &str) -> Result<FrameStream, InfraError> {
        let mut request = url
            .into_client_request()
            .map_err(|error| InfraError::Channel(format!("invalid push url {url}: {error}")))?;
        if let Some(cookie) = self.cookie_header(url) {
            request.headers_mut().insert(COOKIE, cookie);
        }

        let (socket, _) = connect_async(request)
            .await
            .map_err(|error| InfraError::Channel(format!("push connect failed: {error}")))?;

        let frames = socket.filter_map(|message| futures::future::ready(text_frame(message)));
        Ok(frames.boxed())
    }
}

/// Keeps text frames and read errors; binary, ping, pong and close frames
/// are skipped.
fn text_frame(message: Result<Message, tungstenite::Error>) -> Option<Result<String, InfraError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
        Ok(Message::Close(frame)) => {
            tracing::debug!(?frame, "push channel close frame");
            None
        }
        Ok(_) => None,
        Err(error) => Some(Err(InfraError::Channel(error.to_string()))),
    }
}
