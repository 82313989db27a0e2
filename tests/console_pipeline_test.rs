//! Console pipeline integration: LogWriter and Analytics fed the way the
//! supervisor feeds them, over realistic boot transcripts.

use std::time::Duration;

use tempfile::TempDir;

use solhub::console::{Analytics, LogWriter};

/// Feed a raw chunk through the log pipeline and hand the cleaned text to
/// analytics — the supervisor's fan-out contract.
fn feed(log: &LogWriter, analytics: &Analytics, server: &str, chunk: &[u8]) {
    let cleaned = log.write(server, chunk);
    if !cleaned.is_empty() {
        analytics.observe(server, &String::from_utf8_lossy(&cleaned));
    }
}

#[test]
fn test_bios_redraw_dedup_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let log = LogWriter::new(tmp.path().join("logs"), 0);
    let analytics = Analytics::load(tmp.path().join("analytics.json"), &[]);

    for _ in 0..10 {
        feed(&log, &analytics, "srvA", b"PXE-E53: No boot filename received\n");
    }
    feed(&log, &analytics, "srvA", b"Retrying...\n");

    let contents =
        std::fs::read_to_string(tmp.path().join("logs/srvA/current.log")).unwrap();
    assert_eq!(
        contents,
        "PXE-E53: No boot filename received\n(Duplicated 9 lines)\nRetrying...\n"
    );
}

#[test]
fn test_rotation_power_on_delay_flows_to_boot_event() {
    let tmp = TempDir::new().unwrap();
    let log = LogWriter::new(tmp.path().join("logs"), 0);
    let analytics = Analytics::load(tmp.path().join("analytics.json"), &[]);

    // Operator rotates, the machine powers on, first console bytes arrive
    // a little later carrying a firmware marker.
    log.rotate("srvA", None).unwrap();
    analytics.record_rotation("srvA");
    std::thread::sleep(Duration::from_millis(80));
    feed(&log, &analytics, "srvA", b"iPXE 1.21.1 -- Open Source Network Boot\r\n");

    let state = analytics.get("srvA").unwrap();
    let boot = state.current_boot.expect("BIOS marker opens a boot event");
    assert!(boot.rotation_time.is_some());
    let delay = boot.power_on_delay_secs.expect("rotation mark was pending");
    assert!(delay >= 0.08, "measured {delay}s");
    assert!(delay < 5.0, "measured {delay}s");
    assert!(boot.start_time >= boot.rotation_time.unwrap());
    assert_eq!(state.total_reboots, 1);
}

#[test]
fn test_full_boot_transcript() {
    let tmp = TempDir::new().unwrap();
    let log = LogWriter::new(tmp.path().join("logs"), 0);
    let analytics = Analytics::load(tmp.path().join("analytics.json"), &[]);

    let transcript: &[&[u8]] = &[
        b"American Megatrends BIOS 2.21\r\n",
        b"CLIENT MAC ADDR: AA BB CC DD EE FF\r\n",
        b"iPXE booting from SAN\r\n",
        b"e1000e: eth0 NIC Link is Up 1000 Mbps\r\n",
        b"Welcome to Fedora Linux 42\r\n",
        b"Reached target Multi-User System\r\n",
        b"worker-17 login: ",
    ];
    for chunk in transcript {
        feed(&log, &analytics, "srvA", chunk);
    }

    let state = analytics.get("srvA").unwrap();
    assert_eq!(state.total_reboots, 1, "one boot despite three BIOS markers");
    let boot = state.current_boot.unwrap();
    assert!(boot.complete);
    assert_eq!(boot.detected_os.as_deref(), Some("Fedora"));
    assert_eq!(boot.network_events.len(), 1);
    assert_eq!(state.current_os.as_deref(), Some("Fedora"));
    assert_eq!(state.hostname.as_deref(), Some("worker-17"));
    assert!(state.os_up_since.is_some());

    // The cleaned log mirrors the transcript without CR artifacts.
    let contents =
        std::fs::read_to_string(tmp.path().join("logs/srvA/current.log")).unwrap();
    assert!(contents.contains("American Megatrends BIOS 2.21\n"));
    assert!(contents.contains("worker-17 login:"));
    assert!(!contents.contains('\r'));
}

#[test]
fn test_cleaned_log_charset_invariant_under_hostile_input() {
    let tmp = TempDir::new().unwrap();
    let log = LogWriter::new(tmp.path().join("logs"), 0);

    // Binary noise, colour codes, cursor motion, a BEL, high bytes.
    let chunks: &[&[u8]] = &[
        b"\x1b[2J\x1b[1;1H\x1b[0;37;44m BIOS Setup \x07\xFE\xFF\r\n",
        b"\x00\x01\x02 normal text \x1b[K\r\n",
        b"split-escape\x1b[3",
        b"1mred\x1b[0m\r\n",
    ];
    for chunk in chunks {
        let _ = log.write("srvA", chunk);
    }

    let contents = std::fs::read(tmp.path().join("logs/srvA/current.log")).unwrap();
    for b in &contents {
        assert!(
            *b == b'\n' || *b == b'\t' || (0x20..=0x7E).contains(b),
            "byte {b:#04x} escaped the cleaner"
        );
    }
    let text = String::from_utf8(contents).unwrap();
    assert!(!text.contains("\n\n\n"));
    assert!(text.contains("red"));
    assert!(text.contains("normal text"));
}
