//! Prints the Config CustomResourceDefinition as YAML
//!
//! ```bash
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use image_registry_operator::Config;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&Config::crd())?);
    Ok(())
}
