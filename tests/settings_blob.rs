//! Host-level tests for the settings blob parser and editor.

use wifi_kit::settings::blob::{self, Blob};

fn lookup_str<'a>(text: &[u8], key: &str, out: &'a mut [u8]) -> Option<&'a [u8]> {
    let len = Blob::new(text).lookup(key, out)?;
    Some(&out[..len])
}

#[test]
fn lookup_finds_key_at_any_offset() {
    let mut out = [0u8; 64];
    assert_eq!(
        lookup_str(b"key=value\n", "key", &mut out),
        Some(b"value".as_slice())
    );
    assert_eq!(
        lookup_str(b"other=1\nkey=value\nmore=2\n", "key", &mut out),
        Some(b"value".as_slice())
    );
    assert_eq!(
        lookup_str(b"a=1\nb=2\nkey=value", "key", &mut out),
        Some(b"value".as_slice())
    );
}

#[test]
fn first_occurrence_wins() {
    let mut out = [0u8; 64];
    assert_eq!(
        lookup_str(b"key=first\nkey=second\n", "key", &mut out),
        Some(b"first".as_slice())
    );
}

#[test]
fn leading_space_breaks_the_match() {
    let mut out = [0u8; 64];
    assert_eq!(lookup_str(b" key=a\n", "key", &mut out), None);
    // The spaced line is a different key; the real one is still found.
    assert_eq!(
        lookup_str(b" key=a\nkey=b\n", "key", &mut out),
        Some(b"b".as_slice())
    );
}

#[test]
fn eof_bytes_terminate_the_file() {
    let mut out = [0u8; 64];
    for eof in [0x00u8, 0x1A, 0xFF] {
        let text = [b"before=1\n".as_slice(), &[eof], b"key=value\n"].concat();
        assert_eq!(lookup_str(&text, "key", &mut out), None);
        assert_eq!(
            lookup_str(&text, "before", &mut out),
            Some(b"1".as_slice())
        );
    }
}

#[test]
fn empty_key_never_matches() {
    let mut out = [0u8; 64];
    assert_eq!(lookup_str(b"=value\nx=1\n", "", &mut out), None);
}

#[test]
fn malformed_lines_are_skipped() {
    let mut out = [0u8; 64];
    let text = b"no separator here\n=orphan\nkey=value\n";
    assert_eq!(lookup_str(text, "key", &mut out), Some(b"value".as_slice()));
}

#[test]
fn value_truncation_is_length_driven() {
    let mut small = [0u8; 3];
    let copied = Blob::new(b"key=abcdef\n").lookup("key", &mut small);
    assert_eq!(copied, Some(3));
    assert_eq!(&small, b"abc");

    // A value cut short by the end of the blob returns what was read.
    let mut out = [0u8; 64];
    assert_eq!(lookup_str(b"key=abc", "key", &mut out), Some(b"abc".as_slice()));

    // Empty values are found with length zero.
    assert_eq!(lookup_str(b"key=\n", "key", &mut out), Some(b"".as_slice()));
}

#[test]
fn carriage_returns_end_lines_too() {
    let mut out = [0u8; 64];
    assert_eq!(
        lookup_str(b"key=value\rnext=1\r", "next", &mut out),
        Some(b"1".as_slice())
    );
}

#[test]
fn enumeration_walks_every_entry() {
    let text = b"a=1\nskip this\nb=2\nc=\n";
    let blob = Blob::new(text);
    let mut seen = Vec::new();
    let mut cursor = 0;
    while let Some(entry) = blob.next_key(cursor) {
        seen.push((entry.key.to_vec(), entry.value.to_vec()));
        cursor = entry.next_cursor;
    }
    assert_eq!(
        seen,
        vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
            (b"c".to_vec(), b"".to_vec()),
        ]
    );
}

#[test]
fn set_replaces_in_place() {
    let mut buf = [0u8; 64];
    let text = b"a=1\nb=2\nc=3\n";
    buf[..text.len()].copy_from_slice(text);
    let used = blob::set(&mut buf, text.len(), "b", b"99").unwrap();
    assert_eq!(&buf[..used], b"a=1\nb=99\nc=3\n");
}

#[test]
fn set_inserts_new_key_before_incomplete_trailing_line() {
    let mut buf = [0u8; 64];
    let text = b"a=1\npartial";
    buf[..text.len()].copy_from_slice(text);
    let used = blob::set(&mut buf, text.len(), "x", b"9").unwrap();
    assert_eq!(&buf[..used], b"a=1\nx=9\npartial");
}

#[test]
fn set_on_empty_buffer_appends() {
    let mut buf = [0u8; 16];
    let used = blob::set(&mut buf, 0, "k", b"v").unwrap();
    assert_eq!(&buf[..used], b"k=v\n");
}

#[test]
fn set_fails_on_overflow_without_corrupting() {
    let mut buf = [0u8; 8];
    let text = b"a=1\n";
    buf[..text.len()].copy_from_slice(text);
    assert_eq!(blob::set(&mut buf, text.len(), "key", b"longvalue"), None);
    assert_eq!(&buf[..text.len()], text);
}

#[test]
fn discard_removes_every_occurrence_and_terminates() {
    let mut buf = [0u8; 64];
    let text = b"k=1\nother=x\nk=2\nk=3\n";
    buf[..text.len()].copy_from_slice(text);
    let used = blob::discard(&mut buf, text.len(), "k");
    assert_eq!(&buf[..used], b"other=x\n");

    // Discarding a missing key is a no-op.
    let used = blob::discard(&mut buf, used, "absent");
    assert_eq!(&buf[..used], b"other=x\n");
}

#[test]
fn slot_getters_parse_their_fields() {
    let text = b"ssid1=HomeNet\npass1=hunter2\nbssid2=0A:1b:2C:3d:4E:5f\ncountry=GB\nname=sensor\n";
    let blob = Blob::new(text);

    let mut out = [0u8; 32];
    let len = blob.ssid(1, &mut out).unwrap();
    assert_eq!(&out[..len], b"HomeNet");

    let len = blob.password(1, &mut out).unwrap();
    assert_eq!(&out[..len], b"hunter2");
    assert!(blob.password(2, &mut out).is_none());

    assert_eq!(blob.bssid(2), Some([0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x5F]));
    assert_eq!(blob.bssid(1), None);

    assert_eq!(blob.country(), Some(*b"GB"));
    let len = blob.hostname(&mut out).unwrap();
    assert_eq!(&out[..len], b"sensor");
}

#[test]
fn country_must_be_two_uppercase_letters() {
    assert_eq!(Blob::new(b"country=gb\n").country(), None);
    assert_eq!(Blob::new(b"country=GBR\n").country(), None);
    assert_eq!(Blob::new(b"country=G\n").country(), None);
    assert_eq!(Blob::new(b"country=DE\n").country(), Some(*b"DE"));
}

#[test]
fn malformed_bssid_is_rejected() {
    assert_eq!(Blob::new(b"bssid1=0A:1B:2C:3D:4E\n").bssid(1), None);
    assert_eq!(Blob::new(b"bssid1=0A:1B:2C:3D:4E:GG\n").bssid(1), None);
    assert_eq!(Blob::new(b"bssid1=0A1B2C3D4E5F\n").bssid(1), None);
}

#[test]
fn wifi_details_detection() {
    assert!(Blob::new(b"name=x\n").has_no_wifi_details());
    assert!(!Blob::new(b"ssid1=Net\n").has_no_wifi_details());
    assert!(!Blob::new(b"bssid1=0A:1B:2C:3D:4E:5F\n").has_no_wifi_details());
}
