//! Parses the interactive terminal dialect.
//!
//! A peer connected through a raw terminal (e.g. `openssl s_client`)
//! cannot be expected to type JSON envelopes by hand, so bare lines
//! are parsed into envelopes with a small grammar:
//!
//! ```text
//! identity
//! client [name]
//! link <service>
//! <service> <attribute> k=v k="v with spaces" k=[1,2] ...
//! disconnect | exit | __disconnect__
//! ```
//!
//! Recognized literals: `true`/`false`, `null`/`none`, integers,
//! floats, quoted strings, and JSON-like lists. This dialect is a
//! convenience; JSON is authoritative.

use either::Either;
use serde_json::{json, Map, Value};

use crate::hub::communication::message::{Envelope, MANAGER_SERVICE};

/// The result of parsing a raw terminal line: either a Client
/// identity declaration, or a request envelope.
pub type TerminalInput = Either<Value, Envelope>;

/// Parses one raw line; `None` means the line fits no rule.
pub fn parse_terminal_input(line: &str) -> Option<TerminalInput> {
    let line = line.trim();
    let lower = line.to_ascii_lowercase();

    if lower == "identity" {
        let envelope = Envelope::request(MANAGER_SERVICE, "identity", vec![], Map::new(), "");
        return Some(Either::Right(envelope));
    }

    if lower == "__disconnect__" || lower == "disconnect" || lower == "exit" {
        return Some(Either::Right(Envelope::disconnect()));
    }

    if lower == "client" || lower.starts_with("client ") {
        let name = line[6..].trim().replace('"', "");
        let name = if name.is_empty() { "Client" } else { name.as_str() };
        return Some(Either::Left(json!({"type": "client", "name": name})));
    }

    // any line starting with "link" is a link request; the remainder
    // is the Service name, even with no separating space
    if lower.starts_with("link") {
        let service = line[4..].trim().replace('"', "");
        let envelope = Envelope::request(
            MANAGER_SERVICE,
            "link",
            vec![Value::String(service)],
            Map::new(),
            "",
        );
        return Some(Either::Right(envelope));
    }

    // <service> <attribute> [k=v ...]
    let (service, rest) = take_token(line)?;
    let (attribute, rest) = take_token(rest)?;
    let kwargs = parse_kwargs(rest)?;
    let envelope = Envelope::request(&service, &attribute.replace('"', ""), vec![], kwargs, "");
    Some(Either::Right(envelope))
}

// takes one token off the front of `text`: either a quoted string
// (quotes stripped, spaces preserved) or a bare word
fn take_token(text: &str) -> Option<(String, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    if let Some(stripped) = text.strip_prefix('"') {
        let end = stripped.find('"')?;
        Some((stripped[..end].to_string(), &stripped[end + 1..]))
    } else {
        match text.split_once(char::is_whitespace) {
            Some((token, rest)) => Some((token.to_string(), rest)),
            None => Some((text.to_string(), "")),
        }
    }
}

fn parse_kwargs(text: &str) -> Option<Map<String, Value>> {
    let mut kwargs = Map::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            return None;
        }
        let (raw, tail) = take_value(&rest[eq + 1..])?;
        kwargs.insert(key.to_string(), convert_value(&raw));
        rest = tail.trim_start();
    }
    Some(kwargs)
}

// takes a value token: quoted, bracketed list, or bare
fn take_value(text: &str) -> Option<(String, &str)> {
    let text = text.trim_start();
    if text.is_empty() {
        return None;
    }
    let bytes = text.as_bytes();
    match bytes[0] {
        b'"' => {
            let end = text[1..].find('"')?;
            Some((text[..end + 2].to_string(), &text[end + 2..]))
        }
        b'[' => {
            let mut depth = 0usize;
            for (i, b) in bytes.iter().enumerate() {
                match b {
                    b'[' => depth += 1,
                    b']' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some((text[..=i].to_string(), &text[i + 1..]));
                        }
                    }
                    _ => (),
                }
            }
            None
        }
        _ => match text.split_once(char::is_whitespace) {
            Some((token, rest)) => Some((token.to_string(), rest)),
            None => Some((text.to_string(), "")),
        },
    }
}

fn convert_value(raw: &str) -> Value {
    if let Some(stripped) = raw.strip_prefix('"') {
        return Value::String(stripped.trim_end_matches('"').to_string());
    }
    let lower = raw.to_ascii_lowercase();
    match lower.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        "null" | "none" => return Value::Null,
        _ => (),
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::from(f);
    }
    if raw.starts_with('[') {
        if let Ok(value) = serde_json::from_str(&raw.replace('\'', "\"")) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use either::Either;
    use serde_json::json;

    use super::parse_terminal_input;
    use crate::hub::communication::message::{classify, MessageClass};

    fn request(line: &str) -> crate::hub::communication::message::Envelope {
        match parse_terminal_input(line) {
            Some(Either::Right(envelope)) => envelope,
            other => panic!("expected a request envelope, got {:?}", other),
        }
    }

    #[test]
    fn test_identity() {
        let envelope = request("identity");
        assert_eq!(envelope.service.as_deref(), Some("Manager"));
        assert_eq!(envelope.attribute.as_deref(), Some("identity"));
        assert_eq!(envelope.uuid, "");
    }

    #[test]
    fn test_client_declaration() {
        match parse_terminal_input("client") {
            Some(Either::Left(id)) => assert_eq!(id, json!({"type": "client", "name": "Client"})),
            other => panic!("unexpected {:?}", other),
        }
        match parse_terminal_input("client Me and Myself") {
            Some(Either::Left(id)) => {
                assert_eq!(id, json!({"type": "client", "name": "Me and Myself"}))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_link() {
        let envelope = request("link String Editor");
        assert_eq!(envelope.attribute.as_deref(), Some("link"));
        assert_eq!(envelope.args, vec![json!("String Editor")]);

        // no separating space is required after the keyword
        let envelope = request("linkEcho");
        assert_eq!(envelope.attribute.as_deref(), Some("link"));
        assert_eq!(envelope.args, vec![json!("Echo")]);

        // a bare "link" asks for the empty Service name, which the
        // Manager answers with a not-found error
        let envelope = request("link");
        assert_eq!(envelope.args, vec![json!("")]);
    }

    #[test]
    fn test_disconnect_aliases() {
        for line in ["disconnect", "exit", "__disconnect__", "EXIT"] {
            let envelope = request(line);
            assert_eq!(classify(&envelope), MessageClass::Disconnect);
        }
    }

    #[test]
    fn test_service_request_with_kwargs() {
        let envelope = request("BasicMath add x=4 y=10");
        assert_eq!(envelope.service.as_deref(), Some("BasicMath"));
        assert_eq!(envelope.attribute.as_deref(), Some("add"));
        assert_eq!(envelope.kwargs["x"], json!(4));
        assert_eq!(envelope.kwargs["y"], json!(10));
    }

    #[test]
    fn test_quoted_service_and_values() {
        let envelope = request("\"String Editor\" concat s1=\"first string\" s2=second");
        assert_eq!(envelope.service.as_deref(), Some("String Editor"));
        assert_eq!(envelope.attribute.as_deref(), Some("concat"));
        assert_eq!(envelope.kwargs["s1"], json!("first string"));
        assert_eq!(envelope.kwargs["s2"], json!("second"));
    }

    #[test]
    fn test_literals() {
        let envelope = request("Svc call a=true b=FALSE c=null d=none e=1.5 f=-2 g=[1,2,[3]]");
        assert_eq!(envelope.kwargs["a"], json!(true));
        assert_eq!(envelope.kwargs["b"], json!(false));
        assert_eq!(envelope.kwargs["c"], json!(null));
        assert_eq!(envelope.kwargs["d"], json!(null));
        assert_eq!(envelope.kwargs["e"], json!(1.5));
        assert_eq!(envelope.kwargs["f"], json!(-2));
        assert_eq!(envelope.kwargs["g"], json!([1, 2, [3]]));
    }

    #[test]
    fn test_unparsable_lines() {
        assert!(parse_terminal_input("").is_none());
        assert!(parse_terminal_input("just-one-token").is_none());
        assert!(parse_terminal_input("Svc call ==").is_none());
    }
}
