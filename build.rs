use std::fs;
use std::path::{Path, PathBuf};

const ARCHIVAL_FORBIDDEN: &[&str] = &[
    "tokio",
    "std::net",
    "std::fs",
    "Instant::now",
    "SystemTime",
    "hyper",
    "reqwest",
    "println!(",
    "eprintln!(",
];

fn main() {
    println!("cargo:rerun-if-changed=src/archival");
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR missing");
    let archival_dir = Path::new(&manifest_dir).join("src").join("archival");
    let mut files = Vec::new();
    collect_rs_files(&archival_dir, &mut files);
    for path in files {
        let contents = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path.display(), e));
        enforce_archival_guards(&contents, &path);
    }
}

fn collect_rs_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for path in entries.flatten().map(|entry| entry.path()) {
        if path.is_dir() {
            collect_rs_files(&path, files);
        } else if path.extension().is_some_and(|ext| ext == "rs") {
            files.push(path);
        }
    }
}

fn enforce_archival_guards(contents: &str, path: &Path) {
    if let Some(token) = ARCHIVAL_FORBIDDEN.iter().find(|token| contents.contains(*token)) {
        panic!(
            "Forbidden token `{}` in archival module: {}",
            token,
            path.display()
        );
    }
}
