//! Shared helpers for integration tests: an in-memory text codec, frame
//! plumbing, and a scripted ISO 8583 peer.
#![allow(dead_code)]

use std::{collections::BTreeMap, future::Future};

use isolink::{BinaryFramer, BoxError, Connection, MessageCodec, Options};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// Minimal ISO 8583 message: an MTI and numbered string fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMessage {
    pub mti: String,
    pub fields: BTreeMap<u32, String>,
}

impl TestMessage {
    pub fn new(mti: &str) -> Self {
        Self { mti: mti.to_owned(), fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, field: u32, value: &str) -> Self {
        self.fields.insert(field, value.to_owned());
        self
    }

    pub fn field(&self, field: u32) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }
}

/// Packs messages as the MTI followed by `;field=value` pairs.
pub struct TextCodec;

impl MessageCodec for TextCodec {
    type Message = TestMessage;

    fn pack(&self, message: &TestMessage) -> Result<Vec<u8>, BoxError> {
        let mut out = message.mti.clone();
        for (field, value) in &message.fields {
            out.push_str(&format!(";{field}={value}"));
        }
        Ok(out.into_bytes())
    }

    fn unpack(&self, raw: &[u8]) -> Result<TestMessage, BoxError> {
        let text = std::str::from_utf8(raw)?;
        let mut parts = text.split(';');
        let mti = parts.next().filter(|m| !m.is_empty()).ok_or("empty message")?;
        if mti.len() != 4 || !mti.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid mti {mti:?}").into());
        }
        let mut message = TestMessage::new(mti);
        for part in parts {
            let (field, value) = part.split_once('=').ok_or("malformed field")?;
            message.fields.insert(field.parse()?, value.to_owned());
        }
        Ok(message)
    }

    fn mti(&self, message: &TestMessage) -> Option<String> { Some(message.mti.clone()) }

    fn string_field(&self, message: &TestMessage, field: u32) -> Option<String> {
        message.fields.get(&field).cloned()
    }
}

/// A request with the given MTI and STAN (field 11).
pub fn message(mti: &str, stan: &str) -> TestMessage {
    TestMessage::new(mti).with_field(11, stan)
}

/// The matching response: message function flipped to a reply, fields kept.
pub fn response_to(request: &TestMessage) -> TestMessage {
    let mut mti: Vec<char> = request.mti.chars().collect();
    mti[2] = '1';
    TestMessage {
        mti: mti.into_iter().collect(),
        fields: request.fields.clone(),
    }
}

pub fn pack(message: &TestMessage) -> Vec<u8> {
    TextCodec.pack(message).expect("pack test message")
}

pub fn unpack(raw: &[u8]) -> TestMessage {
    TextCodec.unpack(raw).expect("unpack test message")
}

/// Read one two-byte-framed payload from the stream.
pub async fn read_frame<S>(stream: &mut S) -> Option<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await.ok()?;
    let mut payload = vec![0u8; usize::from(u16::from_be_bytes(header))];
    stream.read_exact(&mut payload).await.ok()?;
    Some(payload)
}

/// Write one two-byte-framed payload into the stream.
pub async fn write_frame<S>(stream: &mut S, payload: &[u8])
where
    S: AsyncWrite + Unpin,
{
    let header = u16::try_from(payload.len()).expect("payload fits u16 header");
    stream.write_all(&header.to_be_bytes()).await.expect("write header");
    stream.write_all(payload).await.expect("write payload");
}

/// Bind a listener, run `script` over the first accepted connection, and
/// return the address to dial.
pub async fn spawn_peer<F, Fut>(script: F) -> String
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind peer");
    let addr = listener.local_addr().expect("peer addr").to_string();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        script(stream).await;
    });
    addr
}

/// A connection over the text codec and two-byte binary framing.
pub fn connection(addr: &str, options: Options<TextCodec>) -> Connection<TextCodec> {
    Connection::new(addr, TextCodec, BinaryFramer::u16(), options)
}
