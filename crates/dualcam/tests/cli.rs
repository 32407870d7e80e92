use std::fs;
use std::process::Command;

use tempfile::TempDir;

fn dualcam(config_dir: &std::path::Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_dualcam"));
    command
        .env("DUALCAM_CONFIG_DIR", config_dir)
        .env("RUST_LOG", "warn");
    command
}

#[test]
fn soft_backend_records_and_snapshots() {
    let root = TempDir::new().unwrap();
    let output = root.path().join("take.mp4");
    let snapshot = root.path().join("surface.png");

    let result = dualcam(root.path())
        .args(["--backend", "soft", "--size", "320x240", "--filter", "bw"])
        .args(["--duration", "400ms", "--record", "--rotate"])
        .arg("--output")
        .arg(&output)
        .arg("--snapshot")
        .arg(&snapshot)
        .output()
        .expect("failed to run dualcam");

    assert!(
        result.status.success(),
        "dualcam failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("filter:          black & white"), "{stdout}");
    assert!(stdout.contains("context updates: 1"), "{stdout}");

    let manifest = fs::read_to_string(&output).unwrap();
    assert!(manifest.starts_with("# dualcam 320x240 1000000bps"));
    assert!(manifest.lines().any(|line| line.starts_with("frame 0 ")));
    assert!(manifest.lines().any(|line| line.starts_with("context ")));
    assert!(manifest.trim_end().lines().last().unwrap().starts_with("# frames "));

    let png = image::open(&snapshot).unwrap();
    assert_eq!((png.width(), png.height()), (320, 240));
}

#[test]
fn discovered_config_is_applied() {
    let root = TempDir::new().unwrap();
    let output = root.path().join("from-config.mp4");
    fs::write(
        root.path().join("config.toml"),
        format!(
            "version = 1\n[camera]\npreview = \"320x240\"\nframe_interval = \"10ms\"\n\
             [recording]\noutput = {output:?}\nbitrate = 250000\n\
             [display]\nfilter = \"emboss\"\n"
        ),
    )
    .unwrap();

    let result = dualcam(root.path())
        .args(["--backend", "soft", "--duration", "200ms", "--record", "--restart"])
        .output()
        .expect("failed to run dualcam");

    assert!(
        result.status.success(),
        "dualcam failed: {}",
        String::from_utf8_lossy(&result.stderr)
    );
    let stdout = String::from_utf8_lossy(&result.stdout);
    assert!(stdout.contains("filter:          emboss"), "{stdout}");
    let manifest = fs::read_to_string(&output).unwrap();
    assert!(manifest.starts_with("# dualcam 320x240 250000bps"));
}

#[test]
fn invalid_config_fails() {
    let root = TempDir::new().unwrap();
    let config = root.path().join("broken.toml");
    fs::write(&config, "version = 1\n[recording]\nbitrate = 0\n").unwrap();

    let result = dualcam(root.path())
        .args(["--backend", "soft", "--duration", "0s"])
        .arg("--config")
        .arg(&config)
        .output()
        .expect("failed to run dualcam");

    assert!(!result.status.success());
    assert!(String::from_utf8_lossy(&result.stderr).contains("bitrate"));
}
