//! Session-level tests against the virtual OATH applet.

mod common;

use common::{init_logging, VirtualApplet};
use yubikey_oath::domain::crypto::derive_lock_key;
use yubikey_oath::domain::oath::ResponseKind;
use yubikey_oath::*;

const RFC4226_SECRET: &[u8] = b"12345678901234567890";

#[test]
fn test_store_list_and_calculate() {
    init_logging();
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    assert_eq!(session.state(), SessionState::Unlocked);
    assert_eq!(session.version(), Version::new(5, 4, 3));

    let credential = Credential::totp("alice@example.com").with_digits(8);
    session
        .put_credential(&credential, RFC4226_SECRET)
        .unwrap();

    let listed = session.list_credentials().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "alice@example.com");
    assert_eq!(listed[0].oath_type, OathType::Totp);
    assert_eq!(listed[0].hash_algorithm, HashAlgorithm::Sha1);

    // RFC 6238 SHA-1 vector at T = 59 s
    let code = session
        .calculate("alice@example.com", &1u64.to_be_bytes(), true)
        .unwrap();
    assert_eq!(code.kind, ResponseKind::Truncated);
    assert_eq!(code.value().unwrap().as_deref(), Some("94287082"));

    let full = session
        .calculate("alice@example.com", &1u64.to_be_bytes(), false)
        .unwrap();
    assert_eq!(full.kind, ResponseKind::Full);
    assert_eq!(full.raw_response.len(), 20);
    assert_eq!(full.value().unwrap().as_deref(), Some("94287082"));
}

#[test]
fn test_hotp_counter_advances() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    session
        .put_credential(&Credential::hotp("counter", 0), RFC4226_SECRET)
        .unwrap();

    let first = session.calculate("counter", &[], true).unwrap();
    let second = session.calculate("counter", &[], true).unwrap();
    assert_eq!(first.value().unwrap().as_deref(), Some("755224"));
    assert_eq!(second.value().unwrap().as_deref(), Some("287082"));
}

#[test]
fn test_hotp_initial_counter_is_stored() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    session
        .put_credential(&Credential::hotp("imf", 3), RFC4226_SECRET)
        .unwrap();
    assert_eq!(applet.state().credential("imf").unwrap().counter, 3);

    let code = session.calculate("imf", &[], true).unwrap();
    assert_eq!(code.value().unwrap().as_deref(), Some("969429"));
}

#[test]
fn test_calculate_all_kinds() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    session
        .put_credential(&Credential::totp("plain"), RFC4226_SECRET)
        .unwrap();
    session
        .put_credential(&Credential::hotp("hotp", 0), RFC4226_SECRET)
        .unwrap();
    session
        .put_credential(&Credential::totp("touchy").with_touch(true), RFC4226_SECRET)
        .unwrap();

    let codes = session.calculate_all(&1u64.to_be_bytes()).unwrap();
    let kinds: Vec<_> = codes.iter().map(|c| (c.name.as_str(), c.kind)).collect();
    assert_eq!(
        kinds,
        vec![
            ("plain", ResponseKind::Truncated),
            ("hotp", ResponseKind::Hotp),
            ("touchy", ResponseKind::Touch),
        ]
    );
    assert_eq!(codes[0].value().unwrap().as_deref(), Some("287082"));
    assert_eq!(codes[1].value().unwrap(), None);
    assert_eq!(codes[2].value().unwrap(), None);
    // HOTP counters are untouched by calculate-all.
    assert_eq!(applet.state().credential("hotp").unwrap().counter, 0);
}

#[test]
fn test_long_responses_use_continuation() {
    let applet = VirtualApplet::new().with_max_response(16);
    let mut session = OathSession::open(applet.transport()).unwrap();
    for i in 0..6 {
        session
            .put_credential(&Credential::totp(format!("account-{i}")), RFC4226_SECRET)
            .unwrap();
    }

    let listed = session.list_credentials().unwrap();
    assert_eq!(listed.len(), 6);
    assert_eq!(listed[5].name, "account-5");

    let remaining = applet
        .state()
        .received
        .iter()
        .filter(|apdu| apdu[1] == 0xA5)
        .count();
    assert!(remaining > 0);
}

#[test]
fn test_sha512_block_sized_key_is_kept() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    let name = "n".repeat(64);
    let key = vec![0x42; 128];
    session
        .put_credential(
            &Credential::totp(name.clone()).with_algorithm(HashAlgorithm::Sha512),
            &key,
        )
        .unwrap();

    let state = applet.state();
    let stored = state.credential(&name).unwrap();
    assert_eq!(stored.key, key);
    assert_eq!(stored.type_algorithm, 0x23);
}

#[test]
fn test_sha1_key_longer_than_block_is_hashed() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    let key = vec![0x33; 80];
    session
        .put_credential(&Credential::totp("long"), &key)
        .unwrap();
    assert_eq!(
        applet.state().credential("long").unwrap().key,
        HashAlgorithm::Sha1.digest(&key)
    );
}

#[test]
fn test_delete_and_missing_credential() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    session
        .put_credential(&Credential::totp("gone"), RFC4226_SECRET)
        .unwrap();
    session.delete_credential("gone").unwrap();
    assert!(session.list_credentials().unwrap().is_empty());

    let err = session.delete_credential("gone").unwrap_err();
    assert_eq!(
        err.status_word(),
        Some(yubikey_oath::domain::apdu::StatusWord::FILE_NOT_FOUND)
    );
}

#[test]
fn test_storage_full() {
    let applet = VirtualApplet::new().with_capacity(1);
    let mut session = OathSession::open(applet.transport()).unwrap();
    session
        .put_credential(&Credential::totp("one"), RFC4226_SECRET)
        .unwrap();
    let err = session
        .put_credential(&Credential::totp("two"), RFC4226_SECRET)
        .unwrap_err();
    assert!(err.is_storage_full());
}

#[test]
fn test_lock_code_lifecycle() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    let secret = derive_lock_key("hunter2", session.device_id());
    session.set_lock_code(&secret).unwrap();
    session
        .put_credential(&Credential::totp("secret"), RFC4226_SECRET)
        .unwrap();

    session.select().unwrap();
    assert_eq!(session.state(), SessionState::Locked);
    assert!(matches!(session.list_credentials(), Err(OathError::Locked)));

    let wrong = derive_lock_key("hunter3", session.device_id());
    assert!(matches!(
        session.unlock(&wrong),
        Err(OathError::Unlock(UnlockFailure::WrongSecret))
    ));
    assert!(session.is_locked());

    session.select().unwrap();
    session.unlock(&secret).unwrap();
    assert_eq!(session.state(), SessionState::Unlocked);
    assert_eq!(session.list_credentials().unwrap().len(), 1);
    // Already unlocked: nothing is sent.
    let sent = applet.state().received.len();
    session.unlock(&secret).unwrap();
    assert_eq!(applet.state().received.len(), sent);

    session.unset_lock_code().unwrap();
    session.select().unwrap();
    assert_eq!(session.state(), SessionState::Unlocked);
}

fn locked_applet(reply: Vec<u8>) -> (VirtualApplet, OathSession, Vec<u8>) {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    let secret = derive_lock_key("hunter2", session.device_id());
    session.set_lock_code(&secret).unwrap();
    let applet = applet.with_validate_reply(reply);
    session.select().unwrap();
    assert!(session.is_locked());
    (applet, session, secret)
}

#[test]
fn test_wrong_answer_to_host_challenge_is_rejected() {
    let mut reply = vec![0x75, 0x14];
    reply.extend_from_slice(&[0u8; 20]);
    let (_applet, mut session, secret) = locked_applet(reply);

    assert!(matches!(
        session.unlock(&secret),
        Err(OathError::Unlock(UnlockFailure::WrongSecret))
    ));
    assert!(session.is_locked());
    assert!(matches!(session.list_credentials(), Err(OathError::Locked)));
}

#[test]
fn test_missing_answer_to_host_challenge_is_protocol_error() {
    let (_applet, mut session, secret) = locked_applet(Vec::new());

    assert!(matches!(session.unlock(&secret), Err(OathError::Protocol(_))));
    assert!(session.is_locked());
}

#[test]
fn test_empty_secret_is_missing() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    session
        .set_lock_code(&derive_lock_key("pw", session.device_id()))
        .unwrap();
    session.select().unwrap();
    assert!(matches!(
        session.unlock(&[]),
        Err(OathError::Unlock(UnlockFailure::SecretMissing))
    ));
}

#[test]
fn test_reset_wipes_and_reselects() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.transport()).unwrap();
    let original_id = session.device_id().to_vec();
    session
        .set_lock_code(&derive_lock_key("pw", &original_id))
        .unwrap();
    session
        .put_credential(&Credential::totp("x"), RFC4226_SECRET)
        .unwrap();
    session.select().unwrap();
    assert!(session.is_locked());

    session.reset().unwrap();
    assert_eq!(session.state(), SessionState::Unlocked);
    assert_ne!(session.device_id(), original_id.as_slice());
    assert!(session.list_credentials().unwrap().is_empty());
}

#[test]
fn test_touch_requires_firmware_4() {
    let applet = VirtualApplet::new().with_version([3, 1, 0]);
    let mut session = OathSession::open(applet.transport()).unwrap();
    let err = session
        .put_credential(&Credential::totp("t").with_touch(true), RFC4226_SECRET)
        .unwrap_err();
    assert!(matches!(
        err,
        OathError::UnsupportedFirmware { actual, .. } if actual == Version::new(3, 1, 0)
    ));
    assert!(applet.state().credentials.is_empty());
}

#[test]
fn test_close_disconnects() {
    let applet = VirtualApplet::new();
    let mut session = OathSession::open(applet.nfc_transport()).unwrap();
    assert_eq!(session.transport_kind(), TransportKind::Nfc);
    session.close().unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(applet.state().closed);

    let sent = applet.state().received.len();
    assert!(session.list_credentials().unwrap_err().is_transport());
    assert_eq!(applet.state().received.len(), sent);
}
