use circlefy::{archive_digest, inspect_archive, package_app, ArchiveCodec};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const INFO_PLIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>CFBundleExecutable</key>
    <string>Demo</string>
    <key>CFBundleDisplayName</key>
    <string>Demo App</string>
    <key>CFBundleIdentifier</key>
    <string>com.example.demo</string>
    <key>CFBundleVersion</key>
    <string>1.2.3</string>
</dict>
</plist>
"#;

fn demo_app(parent: &Path) -> PathBuf {
    let app = parent.join("Demo.app");
    fs::create_dir_all(app.join("Frameworks/Kit.framework")).unwrap();
    fs::create_dir_all(app.join("Base.lproj")).unwrap();
    fs::write(app.join("Info.plist"), INFO_PLIST).unwrap();
    fs::write(app.join("Demo"), [0xcf, 0xfa, 0xed, 0xfe, 1, 2, 3]).unwrap();
    fs::write(app.join("Frameworks/Kit.framework/Kit"), b"kit").unwrap();
    fs::write(app.join("Base.lproj/Main.strings"), b"\"a\" = \"b\";").unwrap();
    fs::write(app.join(".DS_Store"), b"junk").unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(app.join("Demo"), fs::Permissions::from_mode(0o755)).unwrap();
    }
    app
}

#[test]
fn payload_survives_a_round_trip() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tree");
    let app = demo_app(&root.join("Payload"));

    let ipa = temp.path().join("out.ipa");
    let codec = ArchiveCodec::new(9);
    codec.try_compress_payload(&root, &ipa, |_| {}).unwrap();

    let extracted = temp.path().join("extracted");
    codec.try_decompress(&ipa, &extracted, |_| {}).unwrap();
    let back = extracted.join("Payload/Demo.app");

    for rel in [
        "Info.plist",
        "Demo",
        "Frameworks/Kit.framework/Kit",
        "Base.lproj/Main.strings",
    ] {
        assert_eq!(
            fs::read(back.join(rel)).unwrap(),
            fs::read(app.join(rel)).unwrap(),
            "{} differs",
            rel
        );
    }
    assert!(!back.join(".DS_Store").exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(back.join("Demo")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[test]
fn stored_archives_extract_the_same() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tree");
    demo_app(&root.join("Payload"));

    let stored = temp.path().join("stored.ipa");
    let deflated = temp.path().join("deflated.ipa");
    ArchiveCodec::new(0)
        .try_compress_payload(&root, &stored, |_| {})
        .unwrap();
    ArchiveCodec::new(6)
        .try_compress_payload(&root, &deflated, |_| {})
        .unwrap();
    assert!(fs::metadata(&stored).unwrap().len() > 0);

    let a = temp.path().join("a");
    let b = temp.path().join("b");
    ArchiveCodec::default().try_decompress(&stored, &a, |_| {}).unwrap();
    ArchiveCodec::default().try_decompress(&deflated, &b, |_| {}).unwrap();
    assert_eq!(
        fs::read(a.join("Payload/Demo.app/Demo")).unwrap(),
        fs::read(b.join("Payload/Demo.app/Demo")).unwrap()
    );
}

#[test]
fn progress_starts_at_zero_and_ends_at_hundred() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tree");
    demo_app(&root.join("Payload"));
    let ipa = temp.path().join("out.ipa");

    let mut seen = Vec::new();
    ArchiveCodec::default()
        .try_compress_payload(&root, &ipa, |p| seen.push(p))
        .unwrap();
    assert_eq!(seen.first(), Some(&0.0));
    assert_eq!(seen.last(), Some(&100.0));
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    let mut seen = Vec::new();
    ArchiveCodec::default()
        .try_decompress(&ipa, &temp.path().join("x"), |p| seen.push(p))
        .unwrap();
    assert_eq!(seen.first(), Some(&0.0));
    assert_eq!(seen.last(), Some(&100.0));
}

#[test]
fn failed_compression_leaves_nothing_behind() {
    let temp = TempDir::new().unwrap();
    let ipa = temp.path().join("out.ipa");

    assert!(!ArchiveCodec::default().compress_payload(temp.path(), &ipa, |_| {}));
    assert!(!ipa.exists());
}

#[test]
fn packaged_app_can_be_inspected() {
    let temp = TempDir::new().unwrap();
    let app = demo_app(temp.path());
    let ipa = temp.path().join("Demo.ipa");

    package_app(&ArchiveCodec::default(), &app, &ipa, &temp.path().join("work")).unwrap();

    let summary = inspect_archive(&ipa).unwrap();
    assert_eq!(summary.display_name, "Demo App");
    assert_eq!(summary.bundle_id, "com.example.demo");
    assert_eq!(summary.version, "1.2.3");
    assert_eq!(summary.executable.as_deref(), Some("Demo"));
    assert_eq!(summary.plist_entry, "Payload/Demo.app/Info.plist");

    let digest = archive_digest(&ipa).unwrap();
    assert_eq!(digest.len(), 64);
    assert_eq!(digest, archive_digest(&ipa).unwrap());
    assert_eq!(fs::read_dir(temp.path().join("work")).unwrap().count(), 0);
}

#[test]
fn package_app_requires_info_plist() {
    let temp = TempDir::new().unwrap();
    let app = temp.path().join("Empty.app");
    fs::create_dir_all(&app).unwrap();

    let err = package_app(
        &ArchiveCodec::default(),
        &app,
        &temp.path().join("Empty.ipa"),
        temp.path(),
    )
    .unwrap_err();
    assert!(matches!(err, circlefy::CirclefyError::NotFound(_)));
}
