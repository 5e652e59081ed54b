fn main() {
    // ── macOS: Bluetooth usage string for CoreBluetooth ───────────────────────
    //
    // A bare CLI binary is not an app bundle, so CoreBluetooth has nowhere to
    // find NSBluetoothAlwaysUsageDescription and keeps the central manager
    // "unauthorized": scans return nothing and connects never complete.
    // Linking Info.plist into the __TEXT,__info_plist section gives the
    // binary the same metadata a bundle would carry.
    //
    // CARGO_CFG_TARGET_OS is the target, so cross builds get the section too.
    println!("cargo:rerun-if-changed=build.rs");
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR unset, Info.plist not embedded");
        return;
    };

    // ld … -sectcreate __TEXT __info_plist <dir>/Info.plist
    for arg in ["-sectcreate", "__TEXT", "__info_plist"] {
        println!("cargo:rustc-link-arg-bins={arg}");
    }
    println!("cargo:rustc-link-arg-bins={dir}/Info.plist");
    println!("cargo:rerun-if-changed=Info.plist");
}
