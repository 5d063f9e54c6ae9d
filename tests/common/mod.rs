//! Shared helpers for integration tests.
//!
//! [`VirtualApplet`] answers raw APDUs the way the YubiKey OATH applet does:
//! real HMAC computation, lock-code challenge/response, command chaining and
//! `61xx` response continuation. Its state sits behind an `Arc<Mutex<_>>`
//! so tests can inspect it after handing the transport to a session.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use yubikey_oath::domain::constants::{ins, tag, CLA_CHAINING, PROPERTY_REQUIRE_TOUCH};
use yubikey_oath::domain::crypto::{dynamic_truncate, hmac_sha1};
use yubikey_oath::domain::tlv::{self, Tlv};
use yubikey_oath::{HashAlgorithm, OathError, OathResult, Transport, TransportKind};

/// A credential as the applet stores it.
#[derive(Debug, Clone)]
pub struct StoredKey {
    pub name: String,
    pub type_algorithm: u8,
    pub digits: u8,
    pub key: Vec<u8>,
    pub touch: bool,
    pub counter: u32,
}

impl StoredKey {
    fn algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::from_value(self.type_algorithm & 0x0F).unwrap()
    }

    fn is_hotp(&self) -> bool {
        self.type_algorithm & 0xF0 == 0x10
    }
}

#[derive(Debug)]
pub struct AppletState {
    pub version: [u8; 3],
    pub device_id: Vec<u8>,
    pub lock_key: Option<Vec<u8>>,
    pub challenge: Option<Vec<u8>>,
    pub unlocked: bool,
    pub credentials: Vec<StoredKey>,
    pub capacity: usize,
    /// Largest body returned before answering `61xx`.
    pub max_response: usize,
    /// Every APDU received, in order.
    pub received: Vec<Vec<u8>>,
    pub closed: bool,
    /// Body answered to a correct VALIDATE instead of the real host response.
    pub validate_reply: Option<Vec<u8>>,
    selects: u8,
    pending: VecDeque<u8>,
    chain: Vec<u8>,
}

impl AppletState {
    pub fn select_count(&self) -> usize {
        self.received
            .iter()
            .filter(|apdu| apdu[1] == ins::SELECT && apdu[2] == 0x04)
            .count()
    }

    pub fn credential(&self, name: &str) -> Option<&StoredKey> {
        self.credentials.iter().find(|c| c.name == name)
    }
}

/// Handle to a virtual applet; clone it to open several transports.
#[derive(Clone)]
pub struct VirtualApplet(Arc<Mutex<AppletState>>);

impl VirtualApplet {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(AppletState {
            version: [5, 4, 3],
            device_id: b"\x01\x02\x03\x04\x05\x06\x07\x08".to_vec(),
            lock_key: None,
            challenge: None,
            unlocked: true,
            credentials: Vec::new(),
            capacity: 32,
            max_response: 0xFF,
            received: Vec::new(),
            closed: false,
            validate_reply: None,
            selects: 0,
            pending: VecDeque::new(),
            chain: Vec::new(),
        })))
    }

    pub fn with_version(self, version: [u8; 3]) -> Self {
        self.state().version = version;
        self
    }

    pub fn with_max_response(self, max_response: usize) -> Self {
        self.state().max_response = max_response;
        self
    }

    pub fn with_capacity(self, capacity: usize) -> Self {
        self.state().capacity = capacity;
        self
    }

    /// Accept the host's response but answer VALIDATE with `body`.
    pub fn with_validate_reply(self, body: Vec<u8>) -> Self {
        self.state().validate_reply = Some(body);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, AppletState> {
        self.0.lock().unwrap()
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        self.state().closed = false;
        Box::new(VirtualTransport {
            applet: self.clone(),
            kind: TransportKind::Usb,
        })
    }

    pub fn nfc_transport(&self) -> Box<dyn Transport> {
        self.state().closed = false;
        Box::new(VirtualTransport {
            applet: self.clone(),
            kind: TransportKind::Nfc,
        })
    }
}

struct VirtualTransport {
    applet: VirtualApplet,
    kind: TransportKind,
}

impl Transport for VirtualTransport {
    fn transceive(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>> {
        let mut state = self.applet.state();
        if state.closed {
            return Err(OathError::Transport("virtual applet closed".to_string()));
        }
        state.received.push(apdu.to_vec());
        Ok(process(&mut state, apdu))
    }

    fn close(&mut self) -> OathResult<()> {
        self.applet.state().closed = true;
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

const SW_OK: [u8; 2] = [0x90, 0x00];
const SW_WRONG_DATA: [u8; 2] = [0x6A, 0x80];
const SW_NOT_FOUND: [u8; 2] = [0x6A, 0x82];
const SW_FULL: [u8; 2] = [0x6A, 0x84];
const SW_AUTH_REQUIRED: [u8; 2] = [0x69, 0x82];
const SW_DATA_INVALID: [u8; 2] = [0x69, 0x84];
const SW_INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];

fn status(sw: [u8; 2]) -> Vec<u8> {
    sw.to_vec()
}

fn process(state: &mut AppletState, apdu: &[u8]) -> Vec<u8> {
    let (cla, instruction, p1, p2) = (apdu[0], apdu[1], apdu[2], apdu[3]);
    let lc = apdu[4] as usize;
    let data = &apdu[5..5 + lc];

    if instruction == ins::SEND_REMAINING {
        return next_chunk(state);
    }
    state.pending.clear();

    if cla == CLA_CHAINING {
        state.chain.extend_from_slice(data);
        return status(SW_OK);
    }
    let mut full = std::mem::take(&mut state.chain);
    full.extend_from_slice(data);

    let result = if instruction == ins::SELECT && p1 == 0x04 {
        Ok(select(state))
    } else if instruction == ins::RESET {
        reset(state, p1, p2)
    } else if instruction == ins::VALIDATE {
        validate(state, &full)
    } else if !state.unlocked {
        Err(SW_AUTH_REQUIRED)
    } else {
        match instruction {
            ins::PUT => put(state, &full),
            ins::DELETE => delete(state, &full),
            ins::SET_CODE => set_code(state, &full),
            ins::LIST => Ok(list(state)),
            ins::CALCULATE => calculate(state, &full, p2 == 1),
            ins::CALCULATE_ALL => calculate_all(state, &full),
            _ => Err(SW_INS_NOT_SUPPORTED),
        }
    };

    match result {
        Ok(body) => {
            state.pending = body.into();
            next_chunk(state)
        }
        Err(sw) => status(sw),
    }
}

fn next_chunk(state: &mut AppletState) -> Vec<u8> {
    let take = state.pending.len().min(state.max_response);
    let mut out: Vec<u8> = state.pending.drain(..take).collect();
    let remaining = state.pending.len();
    if remaining == 0 {
        out.extend_from_slice(&SW_OK);
    } else {
        out.extend_from_slice(&[0x61, remaining.min(0xFF) as u8]);
    }
    out
}

fn select(state: &mut AppletState) -> Vec<u8> {
    let mut body = tlv::encode(tag::VERSION, &state.version).unwrap();
    Tlv::new(tag::NAME, state.device_id.clone())
        .encode_into(&mut body)
        .unwrap();
    if state.lock_key.is_some() {
        state.selects = state.selects.wrapping_add(1);
        let challenge = vec![state.selects; 8];
        Tlv::new(tag::CHALLENGE, challenge.clone())
            .encode_into(&mut body)
            .unwrap();
        state.challenge = Some(challenge);
        state.unlocked = false;
    } else {
        state.challenge = None;
        state.unlocked = true;
    }
    body
}

fn fields(data: &[u8]) -> Result<std::collections::BTreeMap<u8, Vec<u8>>, [u8; 2]> {
    tlv::decode_group(data)
        .map(tlv::group_to_map)
        .map_err(|_| SW_WRONG_DATA)
}

fn validate(state: &mut AppletState, data: &[u8]) -> Result<Vec<u8>, [u8; 2]> {
    let fields = fields(data)?;
    let (Some(key), Some(challenge)) = (state.lock_key.clone(), state.challenge.take()) else {
        return Err(SW_DATA_INVALID);
    };
    let expected = hmac_sha1(&key, &challenge).unwrap();
    if fields.get(&tag::RESPONSE) != Some(&expected) {
        return Err(SW_DATA_INVALID);
    }
    let host_challenge = fields.get(&tag::CHALLENGE).ok_or(SW_WRONG_DATA)?;
    state.unlocked = true;
    if let Some(body) = state.validate_reply.clone() {
        return Ok(body);
    }
    Ok(tlv::encode(tag::RESPONSE, &hmac_sha1(&key, host_challenge).unwrap()).unwrap())
}

fn set_code(state: &mut AppletState, data: &[u8]) -> Result<Vec<u8>, [u8; 2]> {
    let fields = fields(data)?;
    let key = fields.get(&tag::KEY).ok_or(SW_WRONG_DATA)?;
    if key.is_empty() {
        state.lock_key = None;
        return Ok(Vec::new());
    }
    let secret = key[1..].to_vec();
    let challenge = fields.get(&tag::CHALLENGE).ok_or(SW_WRONG_DATA)?;
    let response = fields.get(&tag::RESPONSE).ok_or(SW_WRONG_DATA)?;
    if hmac_sha1(&secret, challenge).unwrap() != *response {
        return Err(SW_WRONG_DATA);
    }
    state.lock_key = Some(secret);
    Ok(Vec::new())
}

fn put(state: &mut AppletState, data: &[u8]) -> Result<Vec<u8>, [u8; 2]> {
    let mut name = None;
    let mut key = None;
    let mut touch = false;
    let mut counter = 0;
    let mut offset = 0;
    while offset < data.len() {
        // The property byte follows its tag directly, without a length.
        if data[offset] == tag::PROPERTY {
            touch = data.get(offset + 1) == Some(&PROPERTY_REQUIRE_TOUCH);
            offset += 2;
            continue;
        }
        let (record, next) = Tlv::decode_at(data, offset).map_err(|_| SW_WRONG_DATA)?;
        match record.tag() {
            tag::NAME => name = Some(String::from_utf8(record.value().to_vec()).unwrap()),
            tag::KEY => key = Some(record.value().to_vec()),
            tag::IMF => {
                let bytes: [u8; 4] = record.value().try_into().map_err(|_| SW_WRONG_DATA)?;
                counter = u32::from_be_bytes(bytes);
            }
            _ => return Err(SW_WRONG_DATA),
        }
        offset = next;
    }
    let (Some(name), Some(key)) = (name, key) else {
        return Err(SW_WRONG_DATA);
    };
    if key.len() < 2 {
        return Err(SW_WRONG_DATA);
    }

    let credential = StoredKey {
        name,
        type_algorithm: key[0],
        digits: key[1],
        key: key[2..].to_vec(),
        touch,
        counter,
    };
    if let Some(existing) = state
        .credentials
        .iter_mut()
        .find(|c| c.name == credential.name)
    {
        *existing = credential;
    } else if state.credentials.len() >= state.capacity {
        return Err(SW_FULL);
    } else {
        state.credentials.push(credential);
    }
    Ok(Vec::new())
}

fn delete(state: &mut AppletState, data: &[u8]) -> Result<Vec<u8>, [u8; 2]> {
    let fields = fields(data)?;
    let name = fields.get(&tag::NAME).ok_or(SW_WRONG_DATA)?;
    let before = state.credentials.len();
    state.credentials.retain(|c| c.name.as_bytes() != name.as_slice());
    if state.credentials.len() == before {
        return Err(SW_NOT_FOUND);
    }
    Ok(Vec::new())
}

fn list(state: &AppletState) -> Vec<u8> {
    let mut body = Vec::new();
    for credential in &state.credentials {
        let mut value = vec![credential.type_algorithm];
        value.extend_from_slice(credential.name.as_bytes());
        Tlv::new(tag::NAME_LIST, value).encode_into(&mut body).unwrap();
    }
    body
}

fn compute(credential: &mut StoredKey, challenge: &[u8]) -> Vec<u8> {
    let challenge = if credential.is_hotp() {
        let counter = u64::from(credential.counter).to_be_bytes().to_vec();
        credential.counter += 1;
        counter
    } else {
        challenge.to_vec()
    };
    credential
        .algorithm()
        .hmac(&credential.key, &challenge)
        .unwrap()
}

fn truncated_record(digits: u8, digest: &[u8]) -> Vec<u8> {
    let mut value = vec![digits];
    value.extend_from_slice(&dynamic_truncate(digest).unwrap().to_be_bytes());
    tlv::encode(tag::TRUNCATED_RESPONSE, &value).unwrap()
}

fn calculate(state: &mut AppletState, data: &[u8], truncate: bool) -> Result<Vec<u8>, [u8; 2]> {
    let fields = fields(data)?;
    let name = fields.get(&tag::NAME).ok_or(SW_WRONG_DATA)?;
    let challenge = fields.get(&tag::CHALLENGE).cloned().unwrap_or_default();
    let credential = state
        .credentials
        .iter_mut()
        .find(|c| c.name.as_bytes() == name.as_slice())
        .ok_or(SW_NOT_FOUND)?;

    let digest = compute(credential, &challenge);
    if truncate {
        Ok(truncated_record(credential.digits, &digest))
    } else {
        let mut value = vec![credential.digits];
        value.extend_from_slice(&digest);
        Ok(tlv::encode(tag::RESPONSE, &value).unwrap())
    }
}

fn calculate_all(state: &mut AppletState, data: &[u8]) -> Result<Vec<u8>, [u8; 2]> {
    let fields = fields(data)?;
    let challenge = fields.get(&tag::CHALLENGE).ok_or(SW_WRONG_DATA)?.clone();
    let mut body = Vec::new();
    for credential in &mut state.credentials {
        Tlv::new(tag::NAME, credential.name.as_bytes())
            .encode_into(&mut body)
            .unwrap();
        let record = if credential.touch {
            tlv::encode(tag::TOUCH, &[credential.digits]).unwrap()
        } else if credential.is_hotp() {
            tlv::encode(tag::NO_RESPONSE, &[credential.digits]).unwrap()
        } else {
            let digest = compute(credential, &challenge);
            truncated_record(credential.digits, &digest)
        };
        body.extend_from_slice(&record);
    }
    Ok(body)
}

fn reset(state: &mut AppletState, p1: u8, p2: u8) -> Result<Vec<u8>, [u8; 2]> {
    if (p1, p2) != (0xDE, 0xAD) {
        return Err(SW_WRONG_DATA);
    }
    state.credentials.clear();
    state.lock_key = None;
    state.challenge = None;
    state.unlocked = true;
    for byte in &mut state.device_id {
        *byte = byte.wrapping_add(0x10);
    }
    Ok(Vec::new())
}

/// Replays canned responses and records what was sent.
#[derive(Clone, Default)]
pub struct ScriptedCard(Arc<Mutex<(Vec<Vec<u8>>, VecDeque<Vec<u8>>)>>);

impl ScriptedCard {
    pub fn new(replies: &[&[u8]]) -> Self {
        Self(Arc::new(Mutex::new((
            Vec::new(),
            replies.iter().map(|r| r.to_vec()).collect(),
        ))))
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().0.clone()
    }

    pub fn transport(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

impl Transport for ScriptedCard {
    fn transceive(&mut self, apdu: &[u8]) -> OathResult<Vec<u8>> {
        let mut script = self.0.lock().unwrap();
        script.0.push(apdu.to_vec());
        script
            .1
            .pop_front()
            .ok_or_else(|| OathError::Transport("no scripted reply".to_string()))
    }

    fn close(&mut self) -> OathResult<()> {
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
