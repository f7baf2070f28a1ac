use std::time::{SystemTime, UNIX_EPOCH};

// The flash header pins stored images to the firmware build that wrote them
// (descriptor layouts are not stable across builds), so every build gets a
// fresh fingerprint.
fn main() {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=MICROCLR_BUILD_TIMESTAMP={stamp}");
}
