//! Streaming HTTP/1.1 request parser.
//!
//! A line-oriented state machine over the connection's read buffer:
//! request line, then headers, then at most one body line. A window
//! with no closing CRLF counts as the final line, so a request cut off
//! mid-flight parses incomplete instead of pending. Form-encoded POST
//! bodies feed the login and register flow against the credential
//! store.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::buffer::Buffer;
use crate::users::{StoreError, UserStore};

/// Bare routes that resolve to an `.html` page of the same name.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Why a request could not be answered normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// The request line is not valid HTTP.
    BadRequest,
    /// The credential store could not be reached.
    StoreUnavailable,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::BadRequest => write!(f, "malformed request"),
            ParseError::StoreUnavailable => write!(f, "credential store unavailable"),
        }
    }
}

impl std::error::Error for ParseError {}

impl From<StoreError> for ParseError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable => ParseError::StoreUnavailable,
        }
    }
}

/// One HTTP request, filled in incrementally by `parse`.
pub struct HttpRequest {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    form: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            form: HashMap::new(),
        }
    }

    /// Reset for the next request on the same connection.
    pub fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.method.clear();
        self.path.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
        self.form.clear();
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// A decoded form field, if the body carried one.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    /// Keep the connection open after this request.
    pub fn is_keep_alive(&self) -> bool {
        self.version == "1.1"
            && self.headers.get("Connection").map(String::as_str) == Some("keep-alive")
    }

    /// Consume buffered bytes and advance the state machine.
    ///
    /// A window without a trailing CRLF is treated as the final line and
    /// the buffer is drained, so a truncated request can finish short of
    /// `Finish` and still report success.
    pub fn parse(&mut self, buf: &mut Buffer, store: &dyn UserStore) -> Result<(), ParseError> {
        if buf.readable_bytes() == 0 {
            return Err(ParseError::BadRequest);
        }
        while buf.readable_bytes() > 0 && self.state != ParseState::Finish {
            let window = buf.peek();
            let line_end = find_crlf(window);
            let line_len = line_end.unwrap_or(window.len());
            let line = String::from_utf8_lossy(&window[..line_len]).into_owned();

            match self.state {
                ParseState::RequestLine => {
                    if !self.parse_request_line(&line) {
                        return Err(ParseError::BadRequest);
                    }
                    self.normalize_path();
                }
                ParseState::Headers => {
                    self.parse_header(&line);
                    // Only the closing CRLF can remain after the last
                    // header of a bodiless request. A body that has not
                    // arrived yet is cut off here; Content-Length is
                    // never consulted.
                    if buf.readable_bytes() <= 2 {
                        self.state = ParseState::Finish;
                    }
                }
                ParseState::Body => {
                    self.body = line;
                    self.handle_post(store)?;
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => break,
            }

            match line_end {
                Some(pos) => buf.retrieve(pos + 2),
                None => {
                    buf.retrieve_all();
                    break;
                }
            }
        }
        debug!(method = %self.method, path = %self.path, version = %self.version, "parsed request");
        Ok(())
    }

    /// Split `METHOD SP PATH SP HTTP/VERSION`. Empty method or path pass
    /// through; a version containing a space does not.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.splitn(3, ' ');
        let (method, path, rest) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(p), Some(r)) => (m, p, r),
            _ => return false,
        };
        let version = match rest.strip_prefix("HTTP/") {
            Some(v) if !v.contains(' ') => v,
            _ => return false,
        };
        self.method = method.to_string();
        self.path = path.to_string();
        self.version = version.to_string();
        self.state = ParseState::Headers;
        true
    }

    fn normalize_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_PAGES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((key, rest)) => {
                let value = rest.strip_prefix(' ').unwrap_or(rest);
                self.headers.insert(key.to_string(), value.to_string());
            }
            // Any line that is not `key: value` separates headers from body.
            None => self.state = ParseState::Body,
        }
    }

    /// Decode a form-encoded POST body and, for the login and register
    /// pages, rewrite the path to the verification outcome.
    fn handle_post(&mut self, store: &dyn UserStore) -> Result<(), ParseError> {
        if self.method != "POST"
            || self.headers.get("Content-Type").map(String::as_str)
                != Some("application/x-www-form-urlencoded")
        {
            return Ok(());
        }
        self.decode_form();

        let is_login = match self.path.as_str() {
            "/login.html" => true,
            "/register.html" => false,
            _ => return Ok(()),
        };
        let username = self.form_value("username").unwrap_or("");
        let password = self.form_value("password").unwrap_or("");
        let verified = if username.is_empty() || password.is_empty() {
            false
        } else {
            store.verify(username, password, is_login)?
        };
        self.path = if verified {
            "/welcome.html"
        } else {
            "/error.html"
        }
        .to_string();
        Ok(())
    }

    /// Decode `application/x-www-form-urlencoded` into the form map.
    ///
    /// The first occurrence of a key wins. A `%` escape with non-hex
    /// digits decodes through a zero fallback instead of failing, and an
    /// escape cut off by the end of the body stays a literal `%`.
    fn decode_form(&mut self) {
        if self.body.is_empty() {
            return;
        }
        let bytes = self.body.as_bytes();
        let mut key = String::new();
        let mut token: Vec<u8> = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'=' => {
                    key = String::from_utf8_lossy(&token).into_owned();
                    token.clear();
                }
                b'&' => {
                    let value = String::from_utf8_lossy(&token).into_owned();
                    token.clear();
                    self.form.entry(key.clone()).or_insert(value);
                }
                b'+' => token.push(b' '),
                b'%' => {
                    if i + 2 < bytes.len() {
                        let byte = hex_value(bytes[i + 1]) * 16 + hex_value(bytes[i + 2]);
                        token.push(byte);
                        i += 2;
                    } else {
                        token.push(b'%');
                    }
                }
                other => token.push(other),
            }
            i += 1;
        }
        if !token.is_empty() {
            let value = String::from_utf8_lossy(&token).into_owned();
            self.form.entry(key).or_insert(value);
        }
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn hex_value(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'A'..=b'F' => b - b'A' + 10,
        b'a'..=b'f' => b - b'a' + 10,
        _ => 0,
    }
}

/// Find the position of the first CRLF in the buffer.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| buffer[i] == b'\r' && buffer[i + 1] == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::MemoryUserStore;

    struct FailStore;

    impl UserStore for FailStore {
        fn verify(&self, _: &str, _: &str, _: bool) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable)
        }
    }

    fn parse_bytes(raw: &[u8], store: &dyn UserStore) -> (HttpRequest, Result<(), ParseError>) {
        let mut buf = Buffer::new();
        buf.append(raw);
        let mut req = HttpRequest::new();
        let result = req.parse(&mut buf, store);
        (req, result)
    }

    #[test]
    fn test_get_request_line() {
        let store = MemoryUserStore::new();
        let (req, result) = parse_bytes(b"GET /index HTTP/1.1\r\n\r\n", &store);

        assert_eq!(result, Ok(()));
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.state, ParseState::Finish);
    }

    #[test]
    fn test_bad_request_line() {
        let store = MemoryUserStore::new();
        let (_, result) = parse_bytes(b"BADLINE\r\n\r\n", &store);
        assert_eq!(result, Err(ParseError::BadRequest));
    }

    #[test]
    fn test_empty_buffer_fails() {
        let store = MemoryUserStore::new();
        let mut buf = Buffer::new();
        let mut req = HttpRequest::new();
        assert_eq!(req.parse(&mut buf, &store), Err(ParseError::BadRequest));
    }

    #[test]
    fn test_path_normalization() {
        let store = MemoryUserStore::new();
        let (req, _) = parse_bytes(b"GET / HTTP/1.1\r\n\r\n", &store);
        assert_eq!(req.path(), "/index.html");

        let (req, _) = parse_bytes(b"GET /picture HTTP/1.1\r\n\r\n", &store);
        assert_eq!(req.path(), "/picture.html");

        let (req, _) = parse_bytes(b"GET /other HTTP/1.1\r\n\r\n", &store);
        assert_eq!(req.path(), "/other");
    }

    #[test]
    fn test_version_with_space_is_rejected() {
        let store = MemoryUserStore::new();
        let (_, result) = parse_bytes(b"GET / HTTP/1.1 extra\r\n\r\n", &store);
        assert_eq!(result, Err(ParseError::BadRequest));
    }

    #[test]
    fn test_window_without_crlf_is_drained() {
        let store = MemoryUserStore::new();
        let mut buf = Buffer::new();
        buf.append(b"GET /index HTTP/1.1");
        let mut req = HttpRequest::new();

        assert_eq!(req.parse(&mut buf, &store), Ok(()));
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(req.state, ParseState::Headers);
    }

    #[test]
    fn test_header_splitting() {
        let store = MemoryUserStore::new();
        let (req, result) = parse_bytes(
            b"GET / HTTP/1.1\r\nHost: localhost:1316\r\nX-Pad:  wide\r\nX-Dup: a\r\nX-Dup: b\r\n\r\n",
            &store,
        );

        assert_eq!(result, Ok(()));
        // value keeps everything past the first colon, minus one space
        assert_eq!(req.headers.get("Host").map(String::as_str), Some("localhost:1316"));
        assert_eq!(req.headers.get("X-Pad").map(String::as_str), Some(" wide"));
        // last write wins
        assert_eq!(req.headers.get("X-Dup").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_keep_alive_matrix() {
        let store = MemoryUserStore::new();

        let (req, _) = parse_bytes(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", &store);
        assert!(req.is_keep_alive());

        let (req, _) = parse_bytes(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", &store);
        assert!(!req.is_keep_alive());

        let (req, _) = parse_bytes(b"GET / HTTP/1.1\r\n\r\n", &store);
        assert!(!req.is_keep_alive());

        let (req, _) = parse_bytes(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", &store);
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn test_form_decoding() {
        let store = MemoryUserStore::new();
        let (req, result) = parse_bytes(
            b"POST /submit HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              a=1&b=hello%20world&c=x+y",
            &store,
        );

        assert_eq!(result, Ok(()));
        assert_eq!(req.form_value("a"), Some("1"));
        assert_eq!(req.form_value("b"), Some("hello world"));
        assert_eq!(req.form_value("c"), Some("x y"));
    }

    #[test]
    fn test_form_duplicate_key_first_wins() {
        let store = MemoryUserStore::new();
        let (req, _) = parse_bytes(
            b"POST /submit HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              k=1&k=2&k=3",
            &store,
        );
        assert_eq!(req.form_value("k"), Some("1"));
    }

    #[test]
    fn test_form_truncated_escape_stays_literal() {
        let store = MemoryUserStore::new();
        let (req, _) = parse_bytes(
            b"POST /submit HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              a=%2",
            &store,
        );
        assert_eq!(req.form_value("a"), Some("%2"));
    }

    #[test]
    fn test_form_non_hex_escape_decodes_to_zero_byte() {
        let store = MemoryUserStore::new();
        let (req, _) = parse_bytes(
            b"POST /submit HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              a=%ZZ",
            &store,
        );
        assert_eq!(req.form_value("a"), Some("\u{0}"));
    }

    #[test]
    fn test_junk_line_separates_headers_from_body() {
        let store = MemoryUserStore::new();
        let (req, result) = parse_bytes(
            b"POST /submit HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              not a header\r\n\
              a=1",
            &store,
        );

        assert_eq!(result, Ok(()));
        assert_eq!(req.body, "a=1");
        assert_eq!(req.form_value("a"), Some("1"));
    }

    #[test]
    fn test_login_rewrites_path_on_outcome() {
        let store = MemoryUserStore::with_users([("alice".to_string(), "secret".to_string())]);

        let (req, result) = parse_bytes(
            b"POST /login HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              username=alice&password=secret",
            &store,
        );
        assert_eq!(result, Ok(()));
        assert_eq!(req.path(), "/welcome.html");

        let (req, _) = parse_bytes(
            b"POST /login HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              username=alice&password=wrong",
            &store,
        );
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn test_register_creates_account() {
        let store = MemoryUserStore::new();

        let (req, _) = parse_bytes(
            b"POST /register HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              username=bob&password=hunter2",
            &store,
        );
        assert_eq!(req.path(), "/welcome.html");
        assert_eq!(store.verify("bob", "hunter2", true), Ok(true));

        // same username again is rejected
        let (req, _) = parse_bytes(
            b"POST /register HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              username=bob&password=other",
            &store,
        );
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn test_empty_credentials_never_reach_store() {
        // FailStore errors on any call, so success here proves the guard.
        let (req, result) = parse_bytes(
            b"POST /login HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              username=&password=x",
            &FailStore,
        );
        assert_eq!(result, Ok(()));
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn test_store_failure_surfaces() {
        let (_, result) = parse_bytes(
            b"POST /login HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              \r\n\
              username=alice&password=secret",
            &FailStore,
        );
        assert_eq!(result, Err(ParseError::StoreUnavailable));
    }

    #[test]
    fn test_post_without_form_content_type_skips_decoding() {
        let store = MemoryUserStore::new();
        let (req, result) = parse_bytes(
            b"POST /login HTTP/1.1\r\n\
              Content-Type: text/plain\r\n\
              \r\n\
              username=alice&password=secret",
            &store,
        );

        assert_eq!(result, Ok(()));
        assert_eq!(req.path(), "/login.html");
        assert_eq!(req.form_value("username"), None);
    }
}
