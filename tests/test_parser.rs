use bytes::{Bytes, BytesMut};
use switchyard::http::parser::{ParseError, ParseEvent, RequestParser};
use switchyard::http::request::Method;

fn feed(parser: &mut RequestParser, buf: &mut BytesMut) -> Result<Vec<ParseEvent>, ParseError> {
    let mut events = Vec::new();
    while let Some(event) = parser.parse(buf)? {
        events.push(event);
    }
    Ok(events)
}

fn parse_all(req: &[u8]) -> Result<Vec<ParseEvent>, ParseError> {
    let mut parser = RequestParser::new();
    feed(&mut parser, &mut BytesMut::from(req))
}

fn body_of(events: &[ParseEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            ParseEvent::Body(data) => Some(data.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[test]
fn test_parse_post_request_with_body() {
    let events =
        parse_all(b"POST /api HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello").unwrap();

    assert_eq!(
        events[0],
        ParseEvent::RequestLine {
            method: Method::POST,
            target: Bytes::from_static(b"/api"),
        }
    );
    assert_eq!(body_of(&events), b"hello");
    assert_eq!(events.last(), Some(&ParseEvent::MessageComplete));
}

#[test]
fn test_parse_multiple_headers_keep_case_and_order() {
    let events = parse_all(
        b"GET /path HTTP/1.1\r\nHost: example.com\r\nUser-Agent: test-client\r\nAccept: */*\r\n\r\n",
    )
    .unwrap();

    let headers: Vec<(Bytes, Bytes)> = events
        .into_iter()
        .filter_map(|e| match e {
            ParseEvent::Header { name, value } => Some((name, value)),
            _ => None,
        })
        .collect();
    assert_eq!(
        headers,
        vec![
            (Bytes::from_static(b"Host"), Bytes::from_static(b"example.com")),
            (Bytes::from_static(b"User-Agent"), Bytes::from_static(b"test-client")),
            (Bytes::from_static(b"Accept"), Bytes::from_static(b"*/*")),
        ]
    );
}

#[test]
fn test_parse_target_keeps_query_string() {
    let events = parse_all(b"GET /search?q=rust HTTP/1.1\r\nHost: example.com\r\n\r\n").unwrap();

    assert!(matches!(
        &events[0],
        ParseEvent::RequestLine { target, .. } if &target[..] == b"/search?q=rust"
    ));
}

#[test]
fn test_parse_incomplete_request_waits_for_blank_line() {
    let mut parser = RequestParser::new();
    let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: example.com\r\n"[..]);
    let events = feed(&mut parser, &mut buf).unwrap();

    assert_eq!(events.len(), 2);
    assert!(!parser.headers_complete());

    buf.extend_from_slice(b"\r\n");
    let events = feed(&mut parser, &mut buf).unwrap();
    assert_eq!(events, vec![ParseEvent::HeadersComplete, ParseEvent::MessageComplete]);
}

#[test]
fn test_parse_body_split_across_reads() {
    let mut parser = RequestParser::new();
    let mut buf = BytesMut::from(&b"POST /api HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello"[..]);
    let first = feed(&mut parser, &mut buf).unwrap();
    assert_eq!(body_of(&first), b"hello");
    assert!(!parser.is_message_complete());

    buf.extend_from_slice(b"world");
    let second = feed(&mut parser, &mut buf).unwrap();
    assert_eq!(body_of(&second), b"world");
    assert!(parser.is_message_complete());
}

#[test]
fn test_parse_invalid_http_method() {
    assert_eq!(parse_all(b"INVALID / HTTP/1.1\r\n\r\n"), Err(ParseError::InvalidMethod));
    assert_eq!(parse_all(b"get / HTTP/1.1\r\n\r\n"), Err(ParseError::InvalidMethod));
}

#[test]
fn test_parse_malformed_header() {
    assert_eq!(
        parse_all(b"GET / HTTP/1.1\r\nBrokenHeader\r\n\r\n"),
        Err(ParseError::InvalidHeader)
    );
}

#[test]
fn test_parse_unsupported_version() {
    assert_eq!(parse_all(b"GET / HTTP/2.0\r\n\r\n"), Err(ParseError::InvalidVersion));
}

#[test]
fn test_parse_conflicting_content_length() {
    assert_eq!(
        parse_all(b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\nabcd"),
        Err(ParseError::InvalidContentLength)
    );
}

#[test]
fn test_parse_bad_chunk_size() {
    assert_eq!(
        parse_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"),
        Err(ParseError::InvalidChunkSize)
    );
}

#[test]
fn test_parse_overlong_line() {
    let mut req = b"GET /".to_vec();
    req.extend(std::iter::repeat_n(b'a', 9000));
    assert_eq!(parse_all(&req), Err(ParseError::LineTooLong));
}

#[test]
fn test_parse_various_http_methods() {
    let methods = vec![
        ("GET", Method::GET),
        ("POST", Method::POST),
        ("PUT", Method::PUT),
        ("DELETE", Method::DELETE),
        ("HEAD", Method::HEAD),
        ("OPTIONS", Method::OPTIONS),
        ("PATCH", Method::PATCH),
    ];

    for (method_str, expected_method) in methods {
        let req = format!("{} / HTTP/1.1\r\n\r\n", method_str);
        let events = parse_all(req.as_bytes()).unwrap();
        assert!(matches!(
            events[0],
            ParseEvent::RequestLine { method, .. } if method == expected_method
        ));
    }
}

#[test]
fn test_parse_request_with_binary_body() {
    let events =
        parse_all(b"POST /upload HTTP/1.1\r\nContent-Length: 4\r\n\r\n\x00\x01\x02\x03").unwrap();
    assert_eq!(body_of(&events), vec![0, 1, 2, 3]);
}

#[test]
fn test_keep_alive_negotiation() {
    let cases: [(&[u8], bool); 4] = [
        (b"GET / HTTP/1.1\r\n\r\n", true),
        (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false),
        (b"GET / HTTP/1.0\r\n\r\n", false),
        (b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", true),
    ];

    for (req, expected) in cases {
        let mut parser = RequestParser::new();
        feed(&mut parser, &mut BytesMut::from(req)).unwrap();
        assert_eq!(parser.should_keep_alive(), expected, "{}", String::from_utf8_lossy(req));
    }
}

#[test]
fn test_upgrade_request_stops_parsing() {
    let mut parser = RequestParser::new();
    let mut buf = BytesMut::from(
        &b"GET /chat HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n\x81\x05hello"[..],
    );
    let events = feed(&mut parser, &mut buf).unwrap();

    assert_eq!(events.last(), Some(&ParseEvent::MessageComplete));
    assert!(parser.is_upgrade());
    assert!(!parser.should_keep_alive());
    // frames after the head are left for the upgraded protocol
    assert_eq!(&buf[..], b"\x81\x05hello");
}

#[test]
fn test_stray_crlf_before_request_is_skipped() {
    let events = parse_all(b"\r\n\r\nGET / HTTP/1.1\r\n\r\n").unwrap();
    assert!(matches!(events[0], ParseEvent::RequestLine { method: Method::GET, .. }));
}
