//! Build script to generate the C header using cbindgen

fn main() {
    let crate_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap();
    let output_dir = std::path::Path::new(&crate_dir).join("..").join("..").join("include");

    std::fs::create_dir_all(&output_dir).ok();

    let output_file = output_dir.join("bulkhead.h");

    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("BULKHEAD_H".into()),
        ..cbindgen::Config::default()
    };

    cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .generate()
        .expect("Unable to generate C bindings")
        .write_to_file(&output_file);

    println!("cargo:rerun-if-changed=src/lib.rs");
}
