use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use itertools::Itertools;

fn main() {
    // regenerate the error kinds when the module tree changes
    println!("cargo:rerun-if-changed=src/asq");

    let out_dir = env::var("OUT_DIR").unwrap();
    let dest = PathBuf::from(out_dir).join("error_kind.rs");

    let mut kinds = vec![String::from("Error")];
    visit_modules(Path::new("src/asq"), Path::new("src/asq"), &mut kinds);

    let variants = kinds
        .iter()
        .sorted()
        .unique()
        .map(|kind| format!("    {},", kind))
        .join("\n");

    let code = format!(
        "/// The kinds of errors reported by this crate.\n\
         ///\n\
         /// One variant per module, generated by the build script\n\
         /// from the tree under `src/asq`.\n\
         #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]\n\
         pub enum ErrorKind {{\n{}\n}}\n",
        variants,
    );

    fs::write(&dest, code).unwrap();
}

fn visit_modules(root: &Path, dir: &Path, kinds: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() && path.join("mod.rs").exists() {
            let rel = path.strip_prefix(root).unwrap();
            let name: String = rel
                .components()
                .map(|c| camel_case(&c.as_os_str().to_string_lossy()))
                .collect();
            kinds.push(name);
            visit_modules(root, &path, kinds);
        }
    }
}

fn camel_case(segment: &str) -> String {
    segment
        .split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}
