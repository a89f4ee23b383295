use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn tmp_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("packetwave-cli-tests");
    fs::create_dir_all(&dir).ok();
    dir.join(name)
}

fn run_packetwave(args: &[&str]) -> (bool, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_packetwave"))
        .args(args)
        .output()
        .expect("Failed to execute packetwave");

    let text = String::from_utf8_lossy(&output.stderr).to_string()
        + &String::from_utf8_lossy(&output.stdout);
    (output.status.success(), text)
}

#[test]
fn test_encode_writes_wav() {
    let output = tmp_path("encode.wav");
    let (ok, text) = run_packetwave(&[
        "encode",
        "--param",
        "MYCALL=LA7ECA-9",
        output.to_str().unwrap(),
        ">hello",
    ]);
    assert!(ok, "encode failed: {}", text);
    assert!(text.contains("LA7ECA-9"), "unexpected output: {}", text);

    // One short frame plus flags and gaps at 16 bits, 9600 Hz
    let size = fs::metadata(&output).expect("Output file not created").len();
    assert!(size > 10_000, "File too small: {} bytes", size);
    assert!(size < 200_000, "File too large: {} bytes", size);
}

#[test]
fn test_encode_then_decode() {
    let wav = tmp_path("roundtrip.wav");
    let (ok, text) = run_packetwave(&[
        "encode",
        "-p",
        "MYCALL=LA7ECA",
        "-p",
        "DEST=APRS",
        "-p",
        "DIGIPATH=WIDE1-1,WIDE2-1",
        wav.to_str().unwrap(),
        ">first",
        ">second",
    ]);
    assert!(ok, "encode failed: {}", text);

    let (ok, text) = run_packetwave(&["decode", wav.to_str().unwrap()]);
    assert!(ok, "decode failed: {}", text);
    assert!(text.contains("LA7ECA>APRS,WIDE1-1,WIDE2-1:>first"), "got: {}", text);
    assert!(text.contains("LA7ECA>APRS,WIDE1-1,WIDE2-1:>second"), "got: {}", text);
}

#[test]
fn test_decode_json() {
    let wav = tmp_path("json.wav");
    let (ok, _) = run_packetwave(&["encode", "-p", "MYCALL=N0CALL-7", wav.to_str().unwrap(), "!json"]);
    assert!(ok);

    let (ok, text) = run_packetwave(&["decode", "--json", wav.to_str().unwrap()]);
    assert!(ok, "decode failed: {}", text);
    let line = text
        .lines()
        .find(|l| l.starts_with('{'))
        .expect("no JSON line in output");
    let value: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(value["source"], "N0CALL-7");
    assert_eq!(value["destination"], "APAR40");
    assert_eq!(value["info"], "!json");
}

#[test]
fn test_digipeat() {
    let heard = tmp_path("digi_in.wav");
    let repeated = tmp_path("digi_out.wav");
    let (ok, _) = run_packetwave(&["encode", "-p", "MYCALL=LA7ECA-9", heard.to_str().unwrap(), "!relay me"]);
    assert!(ok);

    let (ok, text) = run_packetwave(&[
        "digipeat",
        "-p",
        "MYCALL=LD9TA-4",
        heard.to_str().unwrap(),
        repeated.to_str().unwrap(),
    ]);
    assert!(ok, "digipeat failed: {}", text);
    assert!(text.contains("Repeating 1 frame(s)"), "got: {}", text);

    let (ok, text) = run_packetwave(&["decode", repeated.to_str().unwrap()]);
    assert!(ok);
    assert!(text.contains("LA7ECA-9>APAR40,LD9TA-4*,WIDE1*:!relay me"), "got: {}", text);
}

#[test]
fn test_bad_param_rejected() {
    let wav = tmp_path("bad_param.wav");
    let (ok, _) = run_packetwave(&["encode", "-p", "MYCALL", wav.to_str().unwrap(), "x"]);
    assert!(!ok);
}
