//! SIP message dissector.
//!
//! Line-oriented parser over CRLF-terminated UTF-8 payloads. Requests and
//! responses are recognized by their start line; the headers the pipeline
//! cares about are pulled into [`SipData`] and the body is handed to the
//! SDP sub-dissector.

use crate::dissector::{Parser, ProtocolId};
use crate::packet::{Packet, ProtoData};
use bytes::Bytes;
use strum::{Display, EnumString};

/// SIP request methods, ordered as on the wire registry.
///
/// The ordering matters: methods up to and including `Message` may start
/// a dialog, which the `complete_dialogs_only` match option relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    /// REGISTER
    Register,
    /// INVITE
    Invite,
    /// SUBSCRIBE
    Subscribe,
    /// NOTIFY
    Notify,
    /// OPTIONS
    Options,
    /// PUBLISH
    Publish,
    /// MESSAGE
    Message,
    /// CANCEL
    Cancel,
    /// BYE
    Bye,
    /// ACK
    Ack,
    /// PRACK
    Prack,
    /// INFO
    Info,
    /// REFER
    Refer,
    /// UPDATE
    Update,
}

impl Method {
    /// Whether this method may start a new dialog.
    #[must_use]
    pub fn creates_dialog(self) -> bool {
        self <= Method::Message
    }
}

/// Request method or response status of a SIP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipCode {
    /// A request with its method.
    Request(Method),
    /// A response with its status code.
    Response(u16),
}

impl SipCode {
    /// The request method, when this is a request.
    #[must_use]
    pub fn method(self) -> Option<Method> {
        match self {
            SipCode::Request(method) => Some(method),
            SipCode::Response(_) => None,
        }
    }

    /// The status code, when this is a response.
    #[must_use]
    pub fn response(self) -> Option<u16> {
        match self {
            SipCode::Request(_) => None,
            SipCode::Response(code) => Some(code),
        }
    }

    /// True for requests.
    #[must_use]
    pub fn is_request(self) -> bool {
        matches!(self, SipCode::Request(_))
    }
}

/// Canonical text for well-known response codes.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn response_text(code: u16) -> Option<&'static str> {
    Some(match code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        199 => "Early Dialog Terminated",
        200 => "OK",
        202 => "Accepted",
        204 => "No Notification",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        305 => "Use Proxy",
        380 => "Alternative Service",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Conditional Request Failed",
        413 => "Request Entity Too Large",
        414 => "Request-URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Unsupported URI Scheme",
        417 => "Unknown Resource-Priority",
        420 => "Bad Extension",
        421 => "Extension Required",
        422 => "Session Interval Too Small",
        423 => "Interval Too Brief",
        424 => "Bad Location Information",
        428 => "Use Identity Header",
        429 => "Provide Referrer Identity",
        430 => "Flow Failed",
        433 => "Anonymity Disallowed",
        436 => "Bad Identity-Info",
        437 => "Unsupported Certificate",
        438 => "Invalid Identity Header",
        439 => "First Hop Lacks Outbound Support",
        470 => "Consent Needed",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        484 => "Address Incomplete",
        485 => "Ambiguous",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        493 => "Undecipherable",
        494 => "Security Agreement Required",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        505 => "Version Not Supported",
        513 => "Message Too Large",
        580 => "Precondition Failure",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => return None,
    })
}

/// SIP message data attached to a packet.
#[derive(Debug, Clone)]
pub struct SipData {
    /// Request method or response code.
    pub code: SipCode,
    /// Method name for requests, `"code reason"` for responses.
    pub code_text: String,
    /// Whole message text (headers and body), trimmed to one message.
    pub payload: String,
    /// Declared body length (0 when the header is absent).
    pub content_length: usize,
    /// Call-ID header value.
    pub call_id: String,
    /// X-Call-ID / X-CID header value.
    pub x_call_id: Option<String>,
    /// Numeric part of the CSeq header.
    pub cseq: u64,
    /// Method part of the CSeq header.
    pub cseq_method: Option<Method>,
    /// Authorization or Proxy-Authorization header value.
    pub auth: Option<String>,
    /// From header URI.
    pub from: Option<String>,
    /// User part of the From URI.
    pub from_user: Option<String>,
    /// To header URI.
    pub to: Option<String>,
    /// User part of the To URI.
    pub to_user: Option<String>,
    /// `Reason` header text parameter.
    pub reason_text: Option<String>,
    /// `Warning` header numeric code.
    pub warning: Option<u16>,
    /// True when the To header carries no `tag` parameter yet.
    pub initial: bool,
}

impl SipData {
    /// True for request messages.
    #[must_use]
    pub fn is_request(&self) -> bool {
        self.code.is_request()
    }
}

/// Quick check whether a byte buffer could be the start of a SIP message.
///
/// Used by the TCP reassembler to distinguish "SIP message still forming"
/// from "not SIP at all" when the full parse fails.
#[must_use]
pub fn looks_like_sip(data: &[u8]) -> bool {
    let line_end = data
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(data.len());
    let Ok(line) = std::str::from_utf8(&data[..line_end]) else {
        return false;
    };

    if line.starts_with("SIP/2.0 ") {
        return true;
    }

    let mut tokens = line.splitn(2, ' ');
    let first = tokens.next().unwrap_or("");
    first.parse::<Method>().is_ok() && tokens.next().is_some()
}

/// Extracts the URI and user part from a From/To header value.
///
/// `"Bob" <sip:bob@example.com>;tag=abc` yields
/// `("bob@example.com", Some("bob"))`.
fn parse_name_addr(value: &str) -> (Option<String>, Option<String>) {
    let Some(colon) = value.find(':') else {
        return (None, None);
    };

    let rest = &value[colon + 1..];
    let end = rest
        .find(|c| c == ';' || c == '>' || c == '\r')
        .unwrap_or(rest.len());
    let uri = &rest[..end];
    if uri.is_empty() {
        return (None, None);
    }

    let user = uri.split('@').next().filter(|_| uri.contains('@'));
    (Some(uri.to_string()), user.map(ToString::to_string))
}

/// Headers the dissector extracts, collected during the line walk.
#[derive(Debug, Default)]
struct Headers {
    call_id: Option<String>,
    x_call_id: Option<String>,
    content_length: Option<usize>,
    cseq: u64,
    cseq_method: Option<Method>,
    auth: Option<String>,
    from: Option<String>,
    from_user: Option<String>,
    to: Option<String>,
    to_user: Option<String>,
    reason_text: Option<String>,
    warning: Option<u16>,
    initial: bool,
}

fn parse_headers(text: &str) -> Headers {
    let mut headers = Headers {
        initial: true,
        ..Headers::default()
    };

    for line in text.split("\r\n").skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match name.trim().to_ascii_lowercase().as_str() {
            "call-id" | "i" => headers.call_id = Some(value.to_string()),
            "x-call-id" | "x-cid" => headers.x_call_id = Some(value.to_string()),
            "content-length" | "l" => headers.content_length = value.parse().ok(),
            "cseq" => {
                let mut parts = value.split_whitespace();
                headers.cseq = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
                headers.cseq_method = parts.next().and_then(|m| m.parse().ok());
            }
            "authorization" | "proxy-authorization" => {
                headers.auth = Some(value.to_string());
            }
            "from" | "f" => {
                let (uri, user) = parse_name_addr(value);
                headers.from = uri;
                headers.from_user = user;
            }
            "to" | "t" => {
                headers.initial = !value.contains(";tag=");
                let (uri, user) = parse_name_addr(value);
                headers.to = uri;
                headers.to_user = user;
            }
            "reason" => {
                if let Some(start) = value.find("text=\"") {
                    let rest = &value[start + 6..];
                    if let Some(end) = rest.find('"') {
                        headers.reason_text = Some(rest[..end].to_string());
                    }
                }
            }
            "warning" => {
                let digits: String =
                    value.chars().take_while(char::is_ascii_digit).collect();
                headers.warning = digits.parse().ok();
            }
            _ => {}
        }
    }

    headers
}

/// Parses the start line into a [`SipCode`] and its display text.
fn parse_start_line(line: &str) -> Option<(SipCode, String)> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let (code_str, reason) = rest.split_once(' ')?;
        if code_str.len() != 3 {
            return None;
        }
        let code: u16 = code_str.parse().ok()?;
        let text = response_text(code)
            .map_or_else(|| format!("{code} {reason}"), |t| format!("{code} {t}"));
        return Some((SipCode::Response(code), text));
    }

    let mut tokens = line.split(' ');
    let method: Method = tokens.next()?.parse().ok()?;
    let _uri = tokens.next()?;
    if tokens.next()? != "SIP/2.0" {
        return None;
    }
    Some((SipCode::Request(method), method.to_string()))
}

/// SIP dissector.
#[derive(Debug)]
pub struct SipDissector;

impl SipDissector {
    /// Parses a SIP message, attaching [`SipData`] and passing the body
    /// to the SDP sub-dissector.
    pub fn dissect(
        &mut self,
        parser: &mut Parser,
        packet: &mut Packet,
        data: Bytes,
    ) -> Option<Bytes> {
        let Ok(text) = std::str::from_utf8(&data) else {
            return Some(data);
        };

        let line_end = text.find("\r\n").unwrap_or(text.len());
        let Some((code, code_text)) = parse_start_line(&text[..line_end]) else {
            return Some(data);
        };

        // The empty line separates headers from the body
        let Some(headers_end) = text.find("\r\n\r\n") else {
            return Some(data);
        };
        let body_start = headers_end + 4;

        let headers = parse_headers(&text[..headers_end]);
        let Some(call_id) = headers.call_id else {
            return Some(data);
        };

        // Over TCP the assembled stream must hold the whole declared
        // body before this counts as a complete message; anything past
        // it is the start of the next message
        let message_end = if packet.has_protocol(ProtocolId::Tcp) {
            // Content-Length is mandatory for SIP over TCP
            let Some(content_length) = headers.content_length else {
                return Some(data);
            };
            let end = body_start + content_length;
            if data.len() < end {
                return Some(data);
            }
            end
        } else {
            let declared = headers
                .content_length
                .map_or(data.len(), |cl| body_start + cl);
            declared.min(data.len())
        };

        packet.set_proto(ProtoData::Sip(SipData {
            code,
            code_text,
            payload: text[..message_end].to_string(),
            content_length: headers.content_length.unwrap_or(0),
            call_id,
            x_call_id: headers.x_call_id,
            cseq: headers.cseq,
            cseq_method: headers.cseq_method,
            auth: headers.auth,
            from: headers.from,
            from_user: headers.from_user,
            to: headers.to,
            to_user: headers.to_user,
            reason_text: headers.reason_text,
            warning: headers.warning,
            initial: headers.initial,
        }));

        // Hand the body to SDP
        parser.dissect_next(ProtocolId::Sip, packet, data.slice(body_start..message_end));

        None
    }
}
