use std::collections::BTreeMap;
use std::io::Write;
use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=uf2families.json");
    let json_families = std::fs::read_to_string("uf2families.json")?;
    let families: Vec<FamilyRecord> = serde_json::from_str(&json_families)?;

    // Key the table by numeric ID. The list upstream has a few IDs shared
    // between names; the first one listed wins, matching what the runtime
    // loader does with a user-supplied file.
    let mut by_id = BTreeMap::new();
    for f in families {
        let id = if let Some(hex) = f.id.strip_prefix("0x") {
            u32::from_str_radix(hex, 16)?
        } else {
            f.id.parse()?
        };
        by_id.entry(id).or_insert((f.short_name, f.description));
    }

    let out_dir = std::env::var("OUT_DIR")?;
    let out_path = std::path::Path::new(&out_dir).join("uf2families.rs");
    let mut out = std::fs::File::create(out_path)?;

    writeln!(out, "static BUILTIN_FAMILIES: &[(u32, &str, &str)] = &[")?;
    for (id, (short_name, description)) in by_id {
        writeln!(out, "    ({:#010x}, {:?}, {:?}),", id, short_name, description)?;
    }
    writeln!(out, "];")?;

    Ok(())
}

#[derive(Deserialize)]
struct FamilyRecord {
    id: String,
    short_name: String,
    description: String,
}
