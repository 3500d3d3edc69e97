fn main() {
    // Tell cargo to re-run if linker scripts change
    println!("cargo:rerun-if-changed=memory.x");
    println!("cargo:rerun-if-changed=link.x");
    println!("cargo:rerun-if-changed=build.rs");

    // Host builds (library + tests) never see the linker scripts; only the
    // firmware binary is linked against them.
    if std::env::var_os("CARGO_FEATURE_FIRMWARE").is_none() {
        return;
    }

    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    println!("cargo:rustc-link-search=native={}", manifest_dir);
    println!("cargo:rustc-link-arg-bins=-T{}/memory.x", manifest_dir);
    println!("cargo:rustc-link-arg-bins=-T{}/link.x", manifest_dir);
    println!("cargo:rustc-link-arg-bins=--no-relax");
}
