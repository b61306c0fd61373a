use bytes::{Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::codec::{Decoder, Encoder};

use ajpd::server::payload_cursor::WireEncoding;
use ajpd::server::protocol::{
    AjpCodec, ForwardRequest, OutboundMessage, PacketDirection, BODY_CHUNK_BUDGET,
    MAX_PACKET_SIZE, MAX_PAYLOAD_SIZE, PREFIX_SEND_BODY_CHUNK, REQUEST_HEADERS, REQUEST_METHODS,
};

mod helpers;
use helpers::ProxyRequest;

#[cfg(test)]
mod protocol_tests {
    use super::*;

    // =========================================================================================
    // 1. FORWARD REQUEST ROUND TRIPS
    // =========================================================================================

    mod round_trips {
        use super::*;

        // String attribute codes (ssl_key_size is the lone integer one).
        const STRING_ATTRIBUTES: [u8; 11] = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0C, 0x0D,
        ];

        fn random_token(rng: &mut StdRng, len: usize) -> String {
            (0..len)
                .map(|_| {
                    let c = rng.gen_range(0..36);
                    char::from_digit(c, 36).unwrap()
                })
                .collect()
        }

        #[test]
        fn randomized_header_and_attribute_mixes_survive_parsing() {
            let mut rng = StdRng::seed_from_u64(0x41_4A_50);

            for round in 0..50 {
                let method_index = rng.gen_range(1..=REQUEST_METHODS.len() as u8);
                let uri = format!("/{}", random_token(&mut rng, 12));
                let mut request = ProxyRequest::new(method_index, &uri);

                let mut expected_headers = Vec::new();
                for code in 1..=REQUEST_HEADERS.len() as u8 {
                    // Skip cookie headers; random values are not cookie syntax.
                    if REQUEST_HEADERS[code as usize - 1] == "cookie" || rng.gen_bool(0.6) {
                        continue;
                    }
                    let value_len = rng.gen_range(1..24);
                    let value = random_token(&mut rng, value_len);
                    request = request.coded_header(code, &value);
                    expected_headers
                        .push((REQUEST_HEADERS[code as usize - 1].to_string(), value));
                }
                for i in 0..rng.gen_range(0..4usize) {
                    let name = format!("x-custom-{round}-{i}");
                    let value_len = rng.gen_range(1..24);
                    let value = random_token(&mut rng, value_len);
                    request = request.literal_header(&name, &value);
                    expected_headers.push((name, value));
                }

                let mut expected_attrs = Vec::new();
                for code in STRING_ATTRIBUTES {
                    if rng.gen_bool(0.5) {
                        continue;
                    }
                    let value_len = rng.gen_range(1..16);
                    let value = random_token(&mut rng, value_len);
                    request = request.attribute(code, &value);
                    expected_attrs.push((code, value));
                }

                let encoded = request.encode();
                let parsed = ForwardRequest::parse(
                    Bytes::copy_from_slice(&encoded[1..]),
                    WireEncoding::Utf8,
                )
                .unwrap_or_else(|err| panic!("round {round} failed to parse: {err}"));

                assert_eq!(parsed.method, REQUEST_METHODS[method_index as usize - 1]);
                assert_eq!(parsed.request_uri, uri);
                assert_eq!(parsed.headers, expected_headers, "round {round}");

                for (code, value) in &expected_attrs {
                    let actual = match code {
                        0x01 => &parsed.attributes.context,
                        0x02 => &parsed.attributes.servlet_path,
                        0x03 => &parsed.attributes.remote_user,
                        0x04 => &parsed.attributes.auth_type,
                        0x05 => &parsed.attributes.query_string,
                        0x06 => &parsed.attributes.jvm_route,
                        0x07 => &parsed.attributes.ssl_cert,
                        0x08 => &parsed.attributes.ssl_cipher,
                        0x09 => &parsed.attributes.ssl_session,
                        0x0C => &parsed.attributes.secret,
                        0x0D => &parsed.attributes.stored_method,
                        _ => unreachable!(),
                    };
                    assert_eq!(actual.as_deref(), Some(value.as_str()), "round {round}");
                }
            }
        }

        #[test]
        fn every_method_index_round_trips() {
            for (i, name) in REQUEST_METHODS.iter().enumerate() {
                let encoded = ProxyRequest::new(i as u8 + 1, "/m").encode();
                let parsed =
                    ForwardRequest::parse(Bytes::copy_from_slice(&encoded[1..]), WireEncoding::Utf8)
                        .unwrap();
                assert_eq!(parsed.method, *name);
            }
        }
    }

    // =========================================================================================
    // 2. BODY CHUNK BUDGET
    // =========================================================================================

    mod chunk_budget {
        use super::*;

        /// Split a body the way the request handler does and encode each
        /// slice; decode everything back and compare.
        fn chunk_round_trip(n: usize) {
            let body: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let body = Bytes::from(body);
            let mut codec = AjpCodec::new();
            let mut wire = BytesMut::new();

            let mut offset = 0;
            let mut frames = 0usize;
            while offset < body.len() {
                let end = (offset + BODY_CHUNK_BUDGET).min(body.len());
                let before = wire.len();
                codec
                    .encode(OutboundMessage::SendBodyChunk(body.slice(offset..end)), &mut wire)
                    .expect("chunk within budget");
                let frame_len = wire.len() - before;
                assert!(frame_len <= MAX_PACKET_SIZE);
                assert!(frame_len - 4 <= MAX_PAYLOAD_SIZE);
                offset = end;
                frames += 1;
            }
            assert_eq!(frames, n.div_ceil(BODY_CHUNK_BUDGET));

            let mut reassembled = BytesMut::new();
            while let Some(packet) = codec.decode(&mut wire).expect("well-formed frame") {
                assert_eq!(packet.direction, PacketDirection::ToProxy);
                assert_eq!(packet.payload[0], PREFIX_SEND_BODY_CHUNK);
                let len = u16::from_be_bytes([packet.payload[1], packet.payload[2]]) as usize;
                reassembled.extend_from_slice(&packet.payload[3..3 + len]);
            }
            assert_eq!(reassembled.freeze(), body);
        }

        #[test]
        fn boundary_sizes_round_trip_in_order() {
            for n in [0usize, 1, 8188, 8189, 100_000] {
                chunk_round_trip(n);
            }
        }
    }
}
