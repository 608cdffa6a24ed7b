//! HTTPS requests over embassy-net
//!
//! One-shot reqwless requests with TLS. Certificates are not verified: the
//! device has no trust store. The client owns its socket and TLS buffers so
//! it can live in a static and be shared by the uplink tasks.

use crate::MeterError;
use embassy_net::Stack;
use embassy_net::dns::DnsSocket;
use embassy_net::tcp::client::{TcpClient, TcpClientState};
use log::{debug, warn};
use reqwless::client::{HttpClient, TlsConfig, TlsVerify};
use reqwless::request::{Method, RequestBuilder};

const TCP_BUFFER_SIZE: usize = 4096;
const TLS_READ_BUFFER_SIZE: usize = 16_640;
const TLS_WRITE_BUFFER_SIZE: usize = 4096;
const RESPONSE_BUFFER_SIZE: usize = 2048;

pub struct HttpsClient {
    stack: Stack<'static>,
    seed: u64,
    tcp_state: TcpClientState<1, TCP_BUFFER_SIZE, TCP_BUFFER_SIZE>,
    tls_read_buffer: [u8; TLS_READ_BUFFER_SIZE],
    tls_write_buffer: [u8; TLS_WRITE_BUFFER_SIZE],
    rx_buffer: [u8; RESPONSE_BUFFER_SIZE],
}

impl HttpsClient {
    /// `seed` feeds the TLS handshake randomness
    pub fn new(stack: Stack<'static>, seed: u64) -> Self {
        Self {
            stack,
            seed,
            tcp_state: TcpClientState::new(),
            tls_read_buffer: [0; TLS_READ_BUFFER_SIZE],
            tls_write_buffer: [0; TLS_WRITE_BUFFER_SIZE],
            rx_buffer: [0; RESPONSE_BUFFER_SIZE],
        }
    }

    /// GET `url`, returning the status code of a 2xx response
    pub async fn get(&mut self, url: &str) -> Result<u16, MeterError> {
        self.send(Method::GET, url, None).await
    }

    /// POST a JSON document to `url`
    pub async fn post_json(&mut self, url: &str, body: &str) -> Result<u16, MeterError> {
        self.send(Method::POST, url, Some(body.as_bytes())).await
    }

    async fn send(
        &mut self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
    ) -> Result<u16, MeterError> {
        if !self.stack.is_config_up() {
            return Err(MeterError::NetworkError);
        }

        // Fresh handshake seed per request
        self.seed = self
            .seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);

        let tcp_client = TcpClient::new(self.stack, &self.tcp_state);
        let dns_client = DnsSocket::new(self.stack);
        let tls_config = TlsConfig::new(
            self.seed,
            &mut self.tls_read_buffer,
            &mut self.tls_write_buffer,
            TlsVerify::None,
        );
        let mut http_client = HttpClient::new_with_tls(&tcp_client, &dns_client, tls_config);

        let request = http_client.request(method, url).await.map_err(|e| {
            warn!("[HTTP] Failed to open request: {:?}", e);
            MeterError::NetworkError
        })?;

        let sent = match body {
            Some(body) => {
                let headers = [("Content-Type", "application/json")];
                let mut request = request.headers(&headers).body(body);
                request
                    .send(&mut self.rx_buffer)
                    .await
                    .map(|response| response.status.0)
            }
            None => {
                let mut request = request;
                request
                    .send(&mut self.rx_buffer)
                    .await
                    .map(|response| response.status.0)
            }
        };

        let status = sent.map_err(|e| {
            warn!("[HTTP] Request failed: {:?}", e);
            MeterError::HttpError
        })?;

        if (200..300).contains(&status) {
            debug!("[HTTP] Status {}", status);
            Ok(status)
        } else {
            warn!("[HTTP] Server returned status {}", status);
            Err(MeterError::HttpError)
        }
    }
}
