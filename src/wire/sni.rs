//! TLS ClientHello parsing to extract SNI without decrypting anything.
//!
//! Ported and generalized from the upstream router core's
//! `extract_sni_fast` (`app/proxy_sni.rs`): a fixed-offset walk through the
//! record header, handshake header, client random, session id, cipher
//! suites, compression methods, and extensions, bounds-checked at every
//! step. Unlike the upstream's simplified fallback heuristic
//! (`find_sni_extension`), no substring scanning is used here — only the
//! precise byte layout.

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SERVER_NAME_TYPE_HOSTNAME: u8 = 0x00;

/// Returns the SNI hostname from the first bytes of a TLS stream, or
/// `None` if the buffer is too short, not a ClientHello, or carries no
/// `server_name` extension. Never panics on malformed input.
pub fn parse_sni(buf: &[u8]) -> Option<String> {
    let mut pos = 0usize;

    // TLS record header: content-type(1) version(2) length(2)
    if buf.len() < 5 {
        return None;
    }
    if buf[0] != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    pos += 5;

    // Handshake header: type(1) length(3)
    if buf.len() < pos + 4 {
        return None;
    }
    if buf[pos] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return None;
    }
    pos += 4;

    // Client version(2) + random(32)
    pos += 2 + 32;
    if buf.len() < pos + 1 {
        return None;
    }

    // Session id: 1-byte length prefix
    let session_id_len = buf[pos] as usize;
    pos += 1;
    pos += session_id_len;
    if buf.len() < pos + 2 {
        return None;
    }

    // Cipher suites: 2-byte length prefix
    let cipher_suites_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
    pos += 2;
    pos += cipher_suites_len;
    if buf.len() < pos + 1 {
        return None;
    }

    // Compression methods: 1-byte length prefix
    let compression_len = buf[pos] as usize;
    pos += 1;
    pos += compression_len;
    if buf.len() < pos + 2 {
        return None;
    }

    // Extensions: 2-byte total length
    let extensions_len = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = pos.checked_add(extensions_len)?;
    if buf.len() < extensions_end {
        return None;
    }

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let ext_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return None;
        }

        if ext_type == EXTENSION_SERVER_NAME {
            return parse_server_name_extension(&buf[pos..pos + ext_len]);
        }

        pos += ext_len;
    }

    None
}

fn parse_server_name_extension(ext: &[u8]) -> Option<String> {
    if ext.len() < 2 {
        return None;
    }
    let list_len = u16::from_be_bytes([ext[0], ext[1]]) as usize;
    let mut pos = 2usize;
    let list_end = pos.checked_add(list_len)?.min(ext.len());

    while pos + 3 <= list_end {
        let name_type = ext[pos];
        let name_len = u16::from_be_bytes([ext[pos + 1], ext[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > ext.len() {
            return None;
        }
        if name_type == SERVER_NAME_TYPE_HOSTNAME {
            return std::str::from_utf8(&ext[pos..pos + name_len]).ok().map(String::from);
        }
        pos += name_len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_client_hello(hostname: &str) -> Vec<u8> {
        let host_bytes = hostname.as_bytes();

        let mut server_name_list = Vec::new();
        server_name_list.push(SERVER_NAME_TYPE_HOSTNAME);
        server_name_list.extend_from_slice(&(host_bytes.len() as u16).to_be_bytes());
        server_name_list.extend_from_slice(host_bytes);

        let mut sni_extension_body = Vec::new();
        sni_extension_body.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        sni_extension_body.extend_from_slice(&server_name_list);

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(sni_extension_body.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&sni_extension_body);

        let mut handshake_body = Vec::new();
        handshake_body.extend_from_slice(&[0x03, 0x03]); // client version
        handshake_body.extend_from_slice(&[0u8; 32]); // random
        handshake_body.push(0); // session id length
        handshake_body.extend_from_slice(&[0x00, 0x02]); // cipher suites length
        handshake_body.extend_from_slice(&[0x00, 0x2f]); // one cipher suite
        handshake_body.push(1); // compression methods length
        handshake_body.push(0); // null compression
        handshake_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        handshake_body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_TYPE_CLIENT_HELLO);
        let body_len = handshake_body.len() as u32;
        handshake.extend_from_slice(&body_len.to_be_bytes()[1..]); // 3-byte length
        handshake.extend_from_slice(&handshake_body);

        let mut record = Vec::new();
        record.push(CONTENT_TYPE_HANDSHAKE);
        record.extend_from_slice(&[0x03, 0x01]); // record version
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn extracts_sni_from_well_formed_client_hello() {
        for host in ["example.test", "a.b.example.test", "x"] {
            let hello = build_client_hello(host);
            assert_eq!(parse_sni(&hello).as_deref(), Some(host));
        }
    }

    #[test]
    fn returns_none_for_garbage() {
        assert_eq!(parse_sni(&[]), None);
        assert_eq!(parse_sni(&[0u8; 3]), None);
        assert_eq!(parse_sni(b"GET / HTTP/1.1\r\n\r\n"), None);
        let mut noise = vec![0x16, 0x03, 0x01, 0x00, 0x05, 0x01, 0xff, 0xff, 0xff, 0xff];
        noise.extend_from_slice(&[0u8; 50]);
        assert_eq!(parse_sni(&noise), None);
    }

    #[test]
    fn returns_none_when_truncated_mid_extension() {
        let mut hello = build_client_hello("example.test");
        hello.truncate(hello.len() - 3);
        assert_eq!(parse_sni(&hello), None);
    }

    #[test]
    fn returns_none_for_non_handshake_record() {
        let mut hello = build_client_hello("example.test");
        hello[0] = 0x17; // application data, not handshake
        assert_eq!(parse_sni(&hello), None);
    }
}
