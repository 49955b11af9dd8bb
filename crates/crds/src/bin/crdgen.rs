//! Prints the Sleeper CustomResourceDefinition as YAML.
//!
//! Usage: `cargo run -p crds --bin crdgen > sleeper-crd.yaml`

fn main() -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(&crds::definition())?;
    print!("{yaml}");
    Ok(())
}
