use std::time::Duration;

use palisade_instance::QueryFailureReason;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Result of one successful status/ping exchange, before the engine labels
/// it with the observed lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct RawStatus {
    pub players_online: u32,
    pub players_max: u32,
    pub motd: String,
    pub server_version: String,
    pub latency_ms: u64,
}

const PROTOCOL_VERSION: i32 = -1; // "don't care", per the status handshake
const STATE_STATUS: i32 = 1;
const MAX_STATUS_PAYLOAD: usize = 1024 * 1024;

fn write_varint(buf: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        let mut byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if v == 0 {
            break;
        }
    }
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_varint(buf, s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

/// Length-prefix and frame one packet: VarInt(len) + id + body.
fn frame_packet(packet_id: i32, body: &[u8]) -> Vec<u8> {
    let mut inner = Vec::with_capacity(body.len() + 5);
    write_varint(&mut inner, packet_id);
    inner.extend_from_slice(body);

    let mut out = Vec::with_capacity(inner.len() + 5);
    write_varint(&mut out, inner.len() as i32);
    out.extend_from_slice(&inner);
    out
}

async fn read_varint(stream: &mut TcpStream) -> std::io::Result<i32> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = stream.read_u8().await?;
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value as i32);
        }
        shift += 7;
        if shift >= 35 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "varint too long",
            ));
        }
    }
}

/// Flatten a chat-component MOTD (plain string, or object with `text` and
/// nested `extra` components) into display text.
fn motd_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Object(map) => {
            let mut out = String::new();
            if let Some(serde_json::Value::String(s)) = map.get("text") {
                out.push_str(s);
            }
            if let Some(serde_json::Value::Array(extra)) = map.get("extra") {
                for part in extra {
                    out.push_str(&motd_text(part));
                }
            }
            out
        }
        _ => String::new(),
    }
}

fn parse_status_json(raw: &[u8]) -> Option<(u32, u32, String, String)> {
    let v: serde_json::Value = serde_json::from_slice(raw).ok()?;
    let players = v.get("players")?;
    let online = players.get("online")?.as_u64()? as u32;
    let max = players.get("max")?.as_u64()? as u32;
    let motd = v.get("description").map(motd_text).unwrap_or_default();
    let version = v
        .get("version")
        .and_then(|ver| ver.get("name"))
        .and_then(|n| n.as_str())
        .unwrap_or("unknown")
        .to_string();
    Some((online, max, motd, version))
}

async fn exchange(host: &str, port: u16) -> Result<RawStatus, QueryFailureReason> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(|_| QueryFailureReason::Refused)?;

    // Handshake, then status request.
    let mut body = Vec::new();
    write_varint(&mut body, PROTOCOL_VERSION);
    write_string(&mut body, host);
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut body, STATE_STATUS);
    let mut req = frame_packet(0x00, &body);
    req.extend_from_slice(&frame_packet(0x00, &[]));
    stream
        .write_all(&req)
        .await
        .map_err(|_| QueryFailureReason::ProtocolError)?;

    let total_len = read_varint(&mut stream)
        .await
        .map_err(|_| QueryFailureReason::ProtocolError)?;
    if total_len <= 0 || total_len as usize > MAX_STATUS_PAYLOAD {
        return Err(QueryFailureReason::ProtocolError);
    }
    let packet_id = read_varint(&mut stream)
        .await
        .map_err(|_| QueryFailureReason::ProtocolError)?;
    if packet_id != 0x00 {
        return Err(QueryFailureReason::ProtocolError);
    }
    let json_len = read_varint(&mut stream)
        .await
        .map_err(|_| QueryFailureReason::ProtocolError)?;
    if json_len < 0 || json_len as usize > MAX_STATUS_PAYLOAD {
        return Err(QueryFailureReason::ProtocolError);
    }
    let mut raw = vec![0u8; json_len as usize];
    stream
        .read_exact(&mut raw)
        .await
        .map_err(|_| QueryFailureReason::ProtocolError)?;

    let (players_online, players_max, motd, server_version) =
        parse_status_json(&raw).ok_or(QueryFailureReason::ProtocolError)?;

    // Ping round for latency. Some servers close after the status response;
    // treat a failed ping as zero latency rather than a failed query.
    let ping_started = tokio::time::Instant::now();
    let latency_ms = match ping_pong(&mut stream).await {
        Ok(()) => ping_started.elapsed().as_millis() as u64,
        Err(_) => 0,
    };

    Ok(RawStatus {
        players_online,
        players_max,
        motd,
        server_version,
        latency_ms,
    })
}

async fn ping_pong(stream: &mut TcpStream) -> std::io::Result<()> {
    let payload: i64 = 0x70616c69;
    let packet = frame_packet(0x01, &payload.to_be_bytes());
    stream.write_all(&packet).await?;

    let _len = read_varint(stream).await?;
    let packet_id = read_varint(stream).await?;
    if packet_id != 0x01 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unexpected pong packet id",
        ));
    }
    let echoed = stream.read_i64().await?;
    if echoed != payload {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "pong payload mismatch",
        ));
    }
    Ok(())
}

/// Pull-based status querier speaking the server list ping protocol.
///
/// Failures are values, not panics: a server that is alive but not yet
/// accepting protocol queries during startup reports `Refused` or `Timeout`
/// here while the session probe still says the process is up.
#[derive(Clone, Copy, Debug, Default)]
pub struct StatusMonitor;

impl StatusMonitor {
    pub async fn query(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<RawStatus, QueryFailureReason> {
        match tokio::time::timeout(timeout, exchange(host, port)).await {
            Ok(res) => res,
            Err(_) => Err(QueryFailureReason::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn read_varint_sync(buf: &[u8], pos: &mut usize) -> i32 {
        let mut value: u32 = 0;
        let mut shift = 0u32;
        loop {
            let byte = buf[*pos];
            *pos += 1;
            value |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return value as i32;
            }
            shift += 7;
        }
    }

    #[test]
    fn varint_roundtrip() {
        for v in [0, 1, 127, 128, 255, 25565, 2_097_151, i32::MAX, -1] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            let mut pos = 0;
            assert_eq!(read_varint_sync(&buf, &mut pos), v, "value {v}");
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn motd_flattens_chat_components() {
        let plain = serde_json::json!("A Minecraft Server");
        assert_eq!(motd_text(&plain), "A Minecraft Server");

        let chat = serde_json::json!({
            "text": "Welcome ",
            "extra": [{"text": "to "}, {"text": "Palisade"}]
        });
        assert_eq!(motd_text(&chat), "Welcome to Palisade");
    }

    #[test]
    fn status_json_parses() {
        let raw = br#"{"version":{"name":"1.21.1","protocol":767},"players":{"max":20,"online":3},"description":{"text":"survival"}}"#;
        let (online, max, motd, version) = parse_status_json(raw).unwrap();
        assert_eq!(online, 3);
        assert_eq!(max, 20);
        assert_eq!(motd, "survival");
        assert_eq!(version, "1.21.1");
    }

    async fn fake_server(listener: TcpListener, status_json: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();

        // Drain handshake + status request frames.
        let handshake_len = read_varint(&mut stream).await.unwrap();
        let mut skip = vec![0u8; handshake_len as usize];
        stream.read_exact(&mut skip).await.unwrap();
        let req_len = read_varint(&mut stream).await.unwrap();
        let mut skip = vec![0u8; req_len as usize];
        stream.read_exact(&mut skip).await.unwrap();

        let mut body = Vec::new();
        write_string(&mut body, status_json);
        stream.write_all(&frame_packet(0x00, &body)).await.unwrap();

        // Echo the ping payload back.
        let _len = read_varint(&mut stream).await.unwrap();
        let _id = read_varint(&mut stream).await.unwrap();
        let payload = stream.read_i64().await.unwrap();
        stream
            .write_all(&frame_packet(0x01, &payload.to_be_bytes()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn query_round_trip_against_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(fake_server(
            listener,
            r#"{"version":{"name":"1.21.1","protocol":767},"players":{"max":20,"online":5},"description":"hello"}"#,
        ));

        let status = StatusMonitor
            .query("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.players_online, 5);
        assert_eq!(status.players_max, 20);
        assert_eq!(status.motd, "hello");
        assert_eq!(status.server_version, "1.21.1");
    }

    #[tokio::test]
    async fn query_reports_refused_when_nothing_listens() {
        // Bind then drop to get a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = StatusMonitor
            .query("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, QueryFailureReason::Refused);
    }

    #[tokio::test]
    async fn query_reports_timeout_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let err = StatusMonitor
            .query("127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert_eq!(err, QueryFailureReason::Timeout);
    }

    #[tokio::test]
    async fn query_reports_protocol_error_on_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 512];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"\x05\x00\x03not-json").await;
        });

        let err = StatusMonitor
            .query("127.0.0.1", port, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, QueryFailureReason::ProtocolError);
    }
}
