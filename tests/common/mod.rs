use std::path::PathBuf;

use gds::schema::{Dictionaries, Schema};
use gds::types::TypeRegistry;

pub fn fixture_path(name: &str) -> PathBuf {
    let mut path =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    path.push("tests/fixtures");
    path.push(name);
    path
}

/// Dictionaries built from the shared schema fixture with a fresh registry.
pub fn load_fixture() -> (TypeRegistry, Dictionaries) {
    let registry = TypeRegistry::default();
    let dicts = Schema::with_file(fixture_path("schema.json"))
        .unwrap()
        .build(&registry)
        .unwrap();
    (registry, dicts)
}
