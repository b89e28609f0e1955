/// HTTP/1.x wire handling for the relay paths: head framing, body framing
/// classification, and byte-accurate body copying. Only what a relaying
/// proxy needs; no header rewriting happens at this layer.

type HeaderField = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    H10,
    H11,
}

impl Protocol {
    fn token(self) -> &'static str {
        match self {
            Self::H10 => "HTTP/1.0",
            Self::H11 => "HTTP/1.1",
        }
    }

    fn from_token(token: &str) -> io::Result<Self> {
        match token {
            "HTTP/1.0" => Ok(Self::H10),
            "HTTP/1.1" => Ok(Self::H11),
            other => Err(wire_error(format!("unsupported protocol {other:?}"))),
        }
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Empty,
    Sized(u64),
    Chunked,
    UntilClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestHead {
    raw: Vec<u8>,
    method: String,
    target: String,
    protocol: Protocol,
    fields: Vec<HeaderField>,
    framing: BodyFraming,
    wants_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResponseHead {
    raw: Vec<u8>,
    status: u16,
    fields: Vec<HeaderField>,
    framing: BodyFraming,
    wants_close: bool,
}

/// Stream wrapper carrying bytes already read past the current message
/// boundary. Heads and bodies are always taken through this so nothing on
/// the wire is lost between messages.
struct Http1Conn<S> {
    io: S,
    pending: Vec<u8>,
}

impl<S> Http1Conn<S> {
    fn new(io: S) -> Self {
        Self {
            io,
            pending: Vec::new(),
        }
    }
}

impl<S: AsyncRead + Unpin> Http1Conn<S> {
    /// Reads up to and including the next blank line. `Ok(None)` means the
    /// peer closed cleanly between messages.
    async fn next_head(&mut self, limit: usize) -> io::Result<Option<Vec<u8>>> {
        self.read_delimited(b"\r\n\r\n", limit, "message head").await
    }

    async fn read_delimited(
        &mut self,
        delimiter: &[u8],
        limit: usize,
        what: &str,
    ) -> io::Result<Option<Vec<u8>>> {
        loop {
            if let Some(at) = locate(&self.pending, delimiter) {
                let taken = self.pending.drain(..at + delimiter.len()).collect();
                return Ok(Some(taken));
            }
            if self.pending.len() > limit {
                return Err(wire_error(format!("{what} exceeded {limit} bytes")));
            }
            let mut buf = [0_u8; IO_CHUNK_SIZE];
            let n = self.io.read(&mut buf).await?;
            if n == 0 {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed mid-{what}"),
                ));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    async fn expect_delimited(
        &mut self,
        delimiter: &[u8],
        limit: usize,
        what: &str,
    ) -> io::Result<Vec<u8>> {
        self.read_delimited(delimiter, limit, what)
            .await?
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed before {what}"),
                )
            })
    }

    /// Copies one message body to `out` exactly as framed, returning the
    /// payload byte count (chunked framing overhead not included).
    async fn copy_body<W>(
        &mut self,
        out: &mut W,
        framing: BodyFraming,
        limit: usize,
    ) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        match framing {
            BodyFraming::Empty => Ok(0),
            BodyFraming::Sized(length) => self.copy_sized(out, length).await,
            BodyFraming::Chunked => self.copy_chunked(out, limit).await,
            BodyFraming::UntilClose => self.copy_to_eof(out).await,
        }
    }

    async fn copy_sized<W>(&mut self, out: &mut W, mut remaining: u64) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut copied = 0_u64;
        if remaining > 0 && !self.pending.is_empty() {
            let take = self.pending.len().min(remaining as usize);
            out.write_all(&self.pending[..take]).await?;
            self.pending.drain(..take);
            remaining -= take as u64;
            copied += take as u64;
        }
        let mut buf = [0_u8; IO_CHUNK_SIZE];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = self.io.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed inside a sized body",
                ));
            }
            out.write_all(&buf[..n]).await?;
            remaining -= n as u64;
            copied += n as u64;
        }
        Ok(copied)
    }

    async fn copy_chunked<W>(&mut self, out: &mut W, limit: usize) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut copied = 0_u64;
        loop {
            let line = self
                .expect_delimited(b"\r\n", CHUNK_LINE_LIMIT, "chunk size line")
                .await?;
            let size = chunk_size(&line)?;
            out.write_all(&line).await?;
            if size == 0 {
                // Trailer section: zero or more fields, then a bare CRLF.
                loop {
                    let trailer = self
                        .expect_delimited(b"\r\n", limit, "chunk trailer")
                        .await?;
                    out.write_all(&trailer).await?;
                    if trailer == b"\r\n" {
                        return Ok(copied);
                    }
                }
            }
            copied += self.copy_sized(out, size).await?;
            let end = self
                .expect_delimited(b"\r\n", CHUNK_LINE_LIMIT, "chunk terminator")
                .await?;
            if end != b"\r\n" {
                return Err(wire_error("chunk data overran its declared size"));
            }
            out.write_all(&end).await?;
        }
    }

    async fn copy_to_eof<W>(&mut self, out: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut copied = 0_u64;
        if !self.pending.is_empty() {
            out.write_all(&self.pending).await?;
            copied += self.pending.len() as u64;
            self.pending.clear();
        }
        let mut buf = [0_u8; IO_CHUNK_SIZE];
        loop {
            let n = self.io.read(&mut buf).await?;
            if n == 0 {
                return Ok(copied);
            }
            out.write_all(&buf[..n]).await?;
            copied += n as u64;
        }
    }

    /// Buffers one message body fully, for paths that must re-frame it.
    async fn slurp_body(&mut self, framing: BodyFraming, limit: usize) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        self.copy_body(&mut body, framing, limit).await?;
        Ok(body)
    }
}

/// First read on an accepted connection, one byte at a time: stops exactly at
/// the head's blank line so tunneled bytes after it (a TLS client hello
/// following CONNECT) stay unread.
async fn read_initial_head<S>(stream: &mut S, limit: usize) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut one = [0_u8; 1];
    loop {
        if stream.read(&mut one).await? == 0 {
            return Err(if head.is_empty() {
                io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "connection closed without a request",
                )
            } else {
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-head")
            });
        }
        head.push(one[0]);
        if head.ends_with(b"\r\n\r\n") {
            return Ok(head);
        }
        if head.len() >= limit {
            return Err(wire_error("initial request head exceeded the configured limit"));
        }
    }
}

fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let (request_line, fields) = split_head(raw, "request")?;
    let mut words = request_line.split(' ');
    let (Some(method), Some(target), Some(proto), None) =
        (words.next(), words.next(), words.next(), words.next())
    else {
        return Err(wire_error(format!("bad request line {request_line:?}")));
    };
    if method.is_empty() || target.is_empty() {
        return Err(wire_error(format!("bad request line {request_line:?}")));
    }
    let protocol = Protocol::from_token(proto)?;
    let framing = request_framing(&fields)?;
    let wants_close = close_requested(protocol, &fields);
    Ok(RequestHead {
        raw: raw.to_vec(),
        method: method.to_string(),
        target: target.to_string(),
        protocol,
        fields,
        framing,
        wants_close,
    })
}

fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let (status_line, fields) = split_head(raw, "response")?;
    // Reason phrase (the remainder after the status code) is passed through
    // inside `raw` and otherwise ignored.
    let mut words = status_line.splitn(3, ' ');
    let protocol = Protocol::from_token(words.next().unwrap_or(""))?;
    let status = words
        .next()
        .and_then(|text| text.parse::<u16>().ok())
        .ok_or_else(|| wire_error(format!("bad status line {status_line:?}")))?;
    let framing = response_framing(&fields, request_method, status)?;
    let wants_close =
        framing == BodyFraming::UntilClose || close_requested(protocol, &fields);
    Ok(ResponseHead {
        raw: raw.to_vec(),
        status,
        fields,
        framing,
        wants_close,
    })
}

fn split_head<'a>(raw: &'a [u8], what: &str) -> io::Result<(&'a str, Vec<HeaderField>)> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| wire_error(format!("{what} head is not valid UTF-8")))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| wire_error(format!("{what} head is empty")))?;

    let mut fields = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            return Err(wire_error("continuation header lines are not accepted"));
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| wire_error(format!("header line {line:?} has no colon")))?;
        if name.is_empty() || name.ends_with([' ', '\t']) {
            return Err(wire_error(format!("malformed header name {name:?}")));
        }
        fields.push((name.to_string(), value.trim().to_string()));
    }
    Ok((start_line, fields))
}

fn request_framing(fields: &[HeaderField]) -> io::Result<BodyFraming> {
    Ok(declared_framing(fields)?.unwrap_or(BodyFraming::Empty))
}

fn response_framing(
    fields: &[HeaderField],
    request_method: &str,
    status: u16,
) -> io::Result<BodyFraming> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyFraming::Empty);
    }
    Ok(declared_framing(fields)?.unwrap_or(BodyFraming::UntilClose))
}

fn declared_framing(fields: &[HeaderField]) -> io::Result<Option<BodyFraming>> {
    let chunked = field_has_token(fields, "transfer-encoding", "chunked");
    let declared = declared_length(fields)?;
    match (chunked, declared) {
        (true, Some(_)) => Err(wire_error(
            "both Transfer-Encoding and Content-Length present",
        )),
        (true, None) => Ok(Some(BodyFraming::Chunked)),
        (false, Some(0)) => Ok(Some(BodyFraming::Empty)),
        (false, Some(length)) => Ok(Some(BodyFraming::Sized(length))),
        (false, None) => Ok(None),
    }
}

fn declared_length(fields: &[HeaderField]) -> io::Result<Option<u64>> {
    let mut declared = None;
    for (name, value) in fields {
        if !name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let length = value
            .trim()
            .parse::<u64>()
            .map_err(|_| wire_error(format!("bad Content-Length {value:?}")))?;
        if declared.is_some_and(|seen| seen != length) {
            return Err(wire_error("Content-Length repeated with different values"));
        }
        declared = Some(length);
    }
    Ok(declared)
}

fn field_value<'a>(fields: &'a [HeaderField], name: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(field, _)| field.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

fn field_has_token(fields: &[HeaderField], name: &str, token: &str) -> bool {
    fields
        .iter()
        .filter(|(field, _)| field.eq_ignore_ascii_case(name))
        .flat_map(|(_, value)| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

fn close_requested(protocol: Protocol, fields: &[HeaderField]) -> bool {
    if field_has_token(fields, "connection", "close") {
        return true;
    }
    protocol == Protocol::H10 && !field_has_token(fields, "connection", "keep-alive")
}

fn encode_request_head(
    method: &str,
    target: &str,
    protocol: Protocol,
    fields: &[HeaderField],
) -> Vec<u8> {
    let mut head = format!("{method} {target} {}\r\n", protocol.token()).into_bytes();
    for (name, value) in fields {
        head.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| wire_error("chunk size line is not valid UTF-8"))?;
    // Chunk extensions after `;` are forwarded but not interpreted.
    let digits = text.split(';').next().unwrap_or(text).trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| wire_error(format!("bad chunk size {digits:?}")))
}

fn locate(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn wire_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Minimal synthetic response for proxy-generated failures.
async fn send_status<W>(stream: &mut W, status: &str, note: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let page = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{note}",
        note.len()
    );
    stream.write_all(page.as_bytes()).await
}
