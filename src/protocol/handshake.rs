//! Handshake encoding
//!
//! The first and only client-initiated message on a tunnel: magic, version,
//! length-prefixed id and secret, then one announcement per exposed service.
//!
//! ```text
//! magic:1  version:1
//! id_len:1 id:<id_len>
//! secret_len:1 secret:<secret_len>
//! service_announcement (separator service_announcement)*
//! ```

use bytes::{BufMut, BytesMut};

use crate::config::Service;

use super::{ID_AS_HOST_PREFIX, MAGIC, OPEN_HOST, OPEN_TCP_PORT, OPTION_AND_NEXT_OPTION, VERSION};

/// Encode the handshake frame. Lengths are validated at config compile
/// time; the result is written to the tunnel in a single write.
pub fn encode(id: &str, secret: &str, services: &[Service]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(64);

    buf.put_u8(MAGIC);
    buf.put_u8(VERSION);

    buf.put_u8(id.len() as u8);
    buf.put_slice(id.as_bytes());

    buf.put_u8(secret.len() as u8);
    buf.put_slice(secret.as_bytes());

    for (i, service) in services.iter().enumerate() {
        if i != 0 {
            buf.put_slice(&OPTION_AND_NEXT_OPTION);
        }
        if service.local_url.scheme.is_tcp() {
            buf.put_slice(&OPEN_TCP_PORT);
            buf.put_u8(service.remote_tcp_random as u8);
            buf.put_u16(service.remote_tcp_port);
        } else if service.host_prefix == id {
            buf.put_slice(&ID_AS_HOST_PREFIX);
        } else {
            buf.put_slice(&OPEN_HOST);
            buf.put_u8(service.host_prefix.len() as u8);
            buf.put_slice(service.host_prefix.as_bytes());
        }
    }

    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LocalUrl, Scheme, Service};
    use std::time::Duration;

    fn http_service(host_prefix: &str) -> Service {
        Service {
            local_url: LocalUrl {
                scheme: Scheme::Http,
                host: "127.0.0.1:8080".to_string(),
            },
            remote_tcp_random: false,
            remote_tcp_port: 0,
            host_prefix: host_prefix.to_string(),
            use_local_as_http_host: false,
            local_timeout: Duration::ZERO,
        }
    }

    fn tcp_service(random: bool, port: u16) -> Service {
        Service {
            local_url: LocalUrl {
                scheme: Scheme::Tcp,
                host: "127.0.0.1:22".to_string(),
            },
            remote_tcp_random: random,
            remote_tcp_port: port,
            host_prefix: String::new(),
            use_local_as_http_host: false,
            local_timeout: Duration::ZERO,
        }
    }

    #[test]
    fn one_http_service_with_id_prefix() {
        let buf = encode("abc", "s", &[http_service("abc")]);
        let mut expected = vec![MAGIC, VERSION, 0x03, b'a', b'b', b'c', 0x01, b's'];
        expected.extend_from_slice(&ID_AS_HOST_PREFIX);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn one_tcp_service_with_fixed_port() {
        let buf = encode("x", "", &[tcp_service(false, 8080)]);
        let mut expected = vec![MAGIC, VERSION, 0x01, b'x', 0x00];
        expected.extend_from_slice(&OPEN_TCP_PORT);
        expected.extend_from_slice(&[0x00, 0x1F, 0x90]);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn random_tcp_port_sets_flag() {
        let buf = encode("x", "", &[tcp_service(true, 0)]);
        let tail = &buf[buf.len() - 5..];
        assert_eq!(&tail[..2], &OPEN_TCP_PORT);
        assert_eq!(tail[2], 0x01);
        assert_eq!(&tail[3..], &[0x00, 0x00]);
    }

    /// Test-side decoder mirroring the server's view of the announcement
    /// list.
    fn decode_announcements(mut rest: &[u8], id_len: usize, secret_len: usize) -> Vec<String> {
        rest = &rest[2 + 1 + id_len + 1 + secret_len..];
        let mut announcements = Vec::new();
        while !rest.is_empty() {
            if !announcements.is_empty() {
                assert_eq!(&rest[..2], &OPTION_AND_NEXT_OPTION);
                rest = &rest[2..];
            }
            let marker = [rest[0], rest[1]];
            rest = &rest[2..];
            match marker {
                OPEN_TCP_PORT => {
                    let port = u16::from_be_bytes([rest[1], rest[2]]);
                    announcements.push(format!("tcp:{}:{}", rest[0], port));
                    rest = &rest[3..];
                }
                ID_AS_HOST_PREFIX => announcements.push("id-as-prefix".to_string()),
                OPEN_HOST => {
                    let len = rest[0] as usize;
                    let prefix = String::from_utf8(rest[1..1 + len].to_vec()).unwrap();
                    announcements.push(format!("host:{}", prefix));
                    rest = &rest[1 + len..];
                }
                other => panic!("unknown marker {:?}", other),
            }
        }
        announcements
    }

    #[test]
    fn announcements_decode_in_order() {
        let services = vec![
            tcp_service(false, 2222),
            http_service("abc"),
            http_service("blog"),
        ];
        let buf = encode("abc", "s3cret", &services);
        let decoded = decode_announcements(&buf, 3, 6);
        assert_eq!(decoded, vec!["tcp:0:2222", "id-as-prefix", "host:blog"]);
    }
}
