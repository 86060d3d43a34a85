use clap::Subcommand;
use serde_json::json;

use atmo_config::AtmoConfig;
use atmo_core::Result;
use atmo_identity::IdentityStore;

#[derive(Subcommand, Debug)]
pub enum IdentityAction {
    /// Print node id, algorithm and public key (creates the identity if missing)
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub(super) fn cmd_identity(config: &AtmoConfig, action: IdentityAction) -> Result<()> {
    match action {
        IdentityAction::Show { json } => {
            let identity = super::load_identity(config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&describe(&identity))?);
            } else {
                print!("{}", render(&identity, &config.key_file().display().to_string()));
            }
            Ok(())
        }
    }
}

fn describe(identity: &IdentityStore) -> serde_json::Value {
    json!({
        "node_id": identity.node_id(),
        "algorithm": identity.algorithm().map(|a| a.as_str()),
        "public_key": identity.public_key().map(|k| k.to_string()),
        "signed": identity.is_signed(),
        "created_at": identity.created_at(),
    })
}

fn render(identity: &IdentityStore, key_file: &str) -> String {
    let mut out = format!("Node id:     {}\n", identity.node_id());
    match identity.public_key() {
        Some(key) => {
            out.push_str(&format!("Algorithm:   {}\n", key.algorithm));
            out.push_str(&format!("Public key:  {key}\n"));
        }
        None => out.push_str("Public key:  none (unsigned identity, cannot issue tokens)\n"),
    }
    out.push_str(&format!("Created:     {}\n", identity.created_at().to_rfc3339()));
    out.push_str(&format!("Key file:    {key_file}\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmo_identity::{KeyAlgorithm, MemoryKeyStore};

    #[test]
    fn test_render_signed_identity() {
        let identity = IdentityStore::load_or_create(&MemoryKeyStore::new(), KeyAlgorithm::Ed25519);
        let text = render(&identity, "/tmp/identity.json");
        assert!(text.contains(identity.node_id()));
        assert!(text.contains("ed25519:"));

        let json = describe(&identity);
        assert_eq!(json["signed"], true);
        assert_eq!(json["algorithm"], "ed25519");
    }

    #[test]
    fn test_render_unsigned_identity() {
        let identity = IdentityStore::load_or_create_with_schemes(&MemoryKeyStore::new(), &[]);
        assert!(render(&identity, "-").contains("unsigned identity"));
        assert!(describe(&identity)["public_key"].is_null());
    }
}
