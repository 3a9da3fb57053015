#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tuyalan::LocalKey;
use tuyalan::crypto;
use tuyalan::error::{Result, TuyaError};
use tuyalan::gcm::GcmFrameParser;
use tuyalan::negotiation::{self, ResponseBody};
use tuyalan::protocol::{self, CommandType, PREFIX_6699, SUFFIX_6699};
use tuyalan::transport::Transport;

/// Records outbound datagrams; never receives anything.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().clone()
    }

    /// Datagrams sent to `target`, oldest first.
    pub fn sent_to(&self, target: SocketAddr) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, addr)| *addr == target)
            .map(|(frame, _)| frame.clone())
            .collect()
    }

    /// Waits until at least `count` datagrams were sent.
    pub async fn wait_for(&self, count: usize) -> Vec<(Vec<u8>, SocketAddr)> {
        for _ in 0..400 {
            let sent = self.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} datagrams, saw {}", count, self.sent().len());
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TuyaError::Transport("network unreachable".into()));
        }
        self.sent.lock().push((data.to_vec(), target));
        Ok(data.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        std::future::pending().await
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok("127.0.0.1:6669".parse().unwrap())
    }
}

pub fn key(byte: u8) -> LocalKey {
    LocalKey::from_bytes(&[byte; 16]).unwrap()
}

/// Answers `request` the way a device holding `local_key` does.
pub fn respond(request: &[u8], local_key: &LocalKey, device_random: [u8; 16]) -> Vec<u8> {
    let body = negotiation::decode_request(request, local_key).unwrap();
    respond_with(
        request,
        ResponseBody {
            gw_id: body.gw_id,
            random: hex::encode(device_random),
            uuid: body.uuid,
        },
    )
}

/// Seals an arbitrary answer to `request` under the discovery key.
pub fn respond_with(request: &[u8], body: ResponseBody) -> Vec<u8> {
    let crc = protocol::frame_crc(request).unwrap();
    GcmFrameParser::discovery()
        .seal(
            PREFIX_6699,
            SUFFIX_6699,
            crc,
            CommandType::SessKeyNegResp.as_u32(),
            &serde_json::to_vec(&body).unwrap(),
            &crypto::random_bytes(),
        )
        .unwrap()
}
