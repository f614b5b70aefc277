//! HTTP response builder.
//!
//! Resolves the request path under the document root, serializes the
//! status line and headers into the connection's write buffer, and
//! memory-maps the file body so the connection can send it as a second
//! write segment without copying. Unservable paths fall back to the
//! site's error pages, or to a generated body when those are missing.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::ptr;

use chrono::Utc;
use tracing::debug;

use crate::buffer::Buffer;

const CODE_STATUS: [(u16, &str); 5] = [
    (200, "OK"),
    (400, "Bad Request"),
    (403, "Forbidden"),
    (404, "Not Found"),
    (500, "Internal Server Error"),
];

const CODE_PAGES: [(u16, &str); 3] = [(400, "/400.html"), (403, "/403.html"), (404, "/404.html")];

const SUFFIX_TYPES: [(&str, &str); 14] = [
    (".html", "text/html"),
    (".xml", "text/xml"),
    (".xhtml", "application/xhtml+xml"),
    (".txt", "text/plain"),
    (".rtf", "application/rtf"),
    (".pdf", "application/pdf"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".mp4", "video/mp4"),
    (".avi", "video/x-msvideo"),
    (".css", "text/css"),
    (".js", "text/javascript"),
];

/// Read-only mapping of a served file.
struct FileMap {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is read-only and owned by exactly one response.
unsafe impl Send for FileMap {}

impl FileMap {
    fn map(file: &File, len: usize) -> io::Result<FileMap> {
        // SAFETY: mapping a readable fd privately; the pointer is
        // checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(FileMap { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the region stays mapped for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        // SAFETY: ptr and len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

/// Response state for one request, rebuilt via `init` and `make_response`.
pub struct HttpResponse {
    code: u16,
    path: String,
    root: PathBuf,
    keep_alive: bool,
    file: Option<FileMap>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            code: 200,
            path: String::new(),
            root: PathBuf::new(),
            keep_alive: false,
            file: None,
        }
    }

    /// Point the builder at the next response. Drops any previous mapping.
    pub fn init(&mut self, root: &Path, path: String, keep_alive: bool, code: u16) {
        self.file = None;
        self.root = root.to_path_buf();
        self.path = path;
        self.keep_alive = keep_alive;
        self.code = code;
    }

    /// Serialize the status line and headers into `buf` and map the body.
    ///
    /// A 200 is downgraded to 404 or 403 when the file cannot be served;
    /// statuses decided upstream pass through untouched. Error statuses
    /// are served from the matching error page when the site provides
    /// one.
    pub fn make_response(&mut self, buf: &mut Buffer) {
        if self.code == 200 {
            self.code = self.resolve_file_status();
        }
        if let Some(page) = error_page(self.code) {
            self.path = page.to_string();
        }
        self.add_status_line(buf);
        self.add_headers(buf);
        self.add_content(buf);
    }

    /// Mapped body bytes for the second write segment.
    pub fn file(&self) -> Option<&[u8]> {
        self.file.as_ref().map(FileMap::as_slice)
    }

    pub fn file_len(&self) -> usize {
        self.file.as_ref().map_or(0, |f| f.len)
    }

    /// Release the mapped body, if any.
    pub fn unmap(&mut self) {
        self.file = None;
    }

    fn file_path(&self) -> PathBuf {
        self.root.join(self.path.trim_start_matches('/'))
    }

    fn resolve_file_status(&self) -> u16 {
        match std::fs::metadata(self.file_path()) {
            Err(_) => 404,
            Ok(meta) if meta.is_dir() => 404,
            Ok(meta) if meta.permissions().mode() & 0o004 == 0 => 403,
            Ok(_) => 200,
        }
    }

    fn add_status_line(&mut self, buf: &mut Buffer) {
        let status = match status_text(self.code) {
            Some(s) => s,
            None => {
                self.code = 400;
                self.path = "/400.html".to_string();
                "Bad Request"
            }
        };
        buf.append(format!("HTTP/1.1 {} {}\r\n", self.code, status).as_bytes());
    }

    fn add_headers(&self, buf: &mut Buffer) {
        if self.keep_alive {
            buf.append(b"Connection: keep-alive\r\n");
            buf.append(b"keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append(b"Connection: close\r\n");
        }
        buf.append(format!("Content-type: {}\r\n", self.file_type()).as_bytes());
        buf.append(
            format!("Date: {}\r\n", Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")).as_bytes(),
        );
    }

    fn file_type(&self) -> &'static str {
        match self.path.rfind('.') {
            Some(idx) => {
                let suffix = &self.path[idx..];
                SUFFIX_TYPES
                    .iter()
                    .find(|(s, _)| *s == suffix)
                    .map(|(_, t)| *t)
                    .unwrap_or("text/plain")
            }
            None => "text/plain",
        }
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let file = match File::open(self.file_path()) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %self.path, error = %e, "cannot open response file");
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        let len = match file.metadata() {
            Ok(meta) if !meta.is_dir() && meta.len() > 0 => meta.len() as usize,
            _ => {
                self.error_content(buf, "File NotFound!");
                return;
            }
        };
        match FileMap::map(&file, len) {
            Ok(map) => {
                buf.append(format!("Content-length: {}\r\n\r\n", len).as_bytes());
                self.file = Some(map);
            }
            Err(e) => {
                debug!(path = %self.path, error = %e, "mmap failed");
                self.error_content(buf, "File NotFound!");
            }
        }
    }

    /// Inline body used when no file can back the response.
    fn error_content(&self, buf: &mut Buffer, message: &str) {
        let status = status_text(self.code).unwrap_or("Bad Request");
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n\
             <p>{}</p><hr><em>minihttpd</em></body></html>",
            self.code, status, message
        );
        buf.append(format!("Content-length: {}\r\n\r\n", body.len()).as_bytes());
        buf.append(body.as_bytes());
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

fn status_text(code: u16) -> Option<&'static str> {
    CODE_STATUS.iter().find(|(c, _)| *c == code).map(|(_, s)| *s)
}

fn error_page(code: u16) -> Option<&'static str> {
    CODE_PAGES.iter().find(|(c, _)| *c == code).map(|(_, p)| *p)
}
