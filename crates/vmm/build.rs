fn main() {
    println!("cargo:rustc-check-cfg=cfg(software_paging)");

    // The real paging implementation only exists for 32-bit x86. Every other
    // target (notably the host running the test suite) gets the software
    // scale model, as does any build that asks for it explicitly.
    let arch = std::env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let emulation = std::env::var("CARGO_FEATURE_SOFTWARE_EMULATION").is_ok();
    if arch != "x86" || emulation {
        println!("cargo:rustc-cfg=software_paging");
    }
}
