#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

//! This crate implements support for the legacy HTTP api spoken by machines
//! that predate SACP over TCP. Every call carries the session token handed
//! out by `connect` as a form field; state is polled with `status`.

mod connection;
mod print;
mod status;
mod upload;

pub use connection::ConnectResponse;
pub use status::Status;

/// Default port of the legacy HTTP api.
pub const DEFAULT_PORT: u16 = 8080;

/// Client for one machine's legacy HTTP api.
#[derive(Debug, Clone)]
pub struct Client {
    pub(crate) url_base: String,
    pub(crate) token: String,
    pub(crate) http: reqwest::Client,
}

impl Client {
    /// Create a new handle to the machine at `host:port`. No request is made
    /// until [Client::connect].
    pub fn new(host: &str, port: u16, token: &str) -> Self {
        Self {
            url_base: format!("http://{}:{}/api/v1", host, port),
            token: token.to_owned(),
            http: reqwest::Client::new(),
        }
    }

    /// The session token sent with every request.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub(crate) async fn post_form(&self, endpoint: &str, fields: &[(&str, String)]) -> anyhow::Result<reqwest::Response> {
        let mut form: Vec<(&str, &str)> = vec![("token", self.token.as_str())];
        form.extend(fields.iter().map(|(key, value)| (*key, value.as_str())));

        tracing::debug!(base = self.url_base, endpoint, "posting");
        let resp = self
            .http
            .post(format!("{}/{}", self.url_base, endpoint))
            .form(&form)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// Answer exactly one HTTP request with `status` and `body`, returning
    /// the raw request text.
    pub(crate) async fn one_shot(status: &str, body: &'static str) -> (u16, tokio::task::JoinHandle<String>) {
        let port = portpicker::pick_unused_port().expect("no free port");
        let listener = TcpListener::bind(("127.0.0.1", port)).await.expect("bind");
        let status = status.to_owned();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.expect("read");
                request.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&request) {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.expect("write");
            String::from_utf8_lossy(&request).into_owned()
        });

        (port, handle)
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some(split) = text.find("\r\n\r\n") else {
            return false;
        };
        let length = text[..split]
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        request.len() >= split + 4 + length
    }
}
