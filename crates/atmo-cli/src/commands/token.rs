use clap::Subcommand;
use std::sync::Arc;
use std::time::Duration;

use atmo_config::AtmoConfig;
use atmo_core::{AtmoError, Result, unix_now};
use atmo_identity::{MembershipToken, PublicKey, TokenIssuer, TokenVerifier, TrustedIssuers, VerificationOutcome};

#[derive(Subcommand, Debug)]
pub enum TokenAction {
    /// Mint a membership token signed by this node as mesh founder
    Issue {
        /// Mesh id (defaults to node.mesh_id)
        #[arg(long)]
        mesh: Option<String>,

        /// Capability to grant (repeatable)
        #[arg(long = "cap", default_value = "member")]
        capabilities: Vec<String>,

        /// Lifetime in seconds (defaults to token.default_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,

        /// Node the token is issued to; omit for a bearer token
        #[arg(long)]
        subject: Option<String>,
    },
    /// Verify a token offline
    Verify {
        /// Encoded token
        token: String,

        /// Issuer public key as <alg>:<base64url>; defaults to the trusted issuers in the config
        #[arg(long)]
        issuer_key: Option<String>,

        /// Expected mesh id (defaults to node.mesh_id)
        #[arg(long)]
        mesh: Option<String>,
    },
}

pub(super) fn cmd_token(config: &AtmoConfig, action: TokenAction) -> Result<()> {
    match action {
        TokenAction::Issue {
            mesh,
            capabilities,
            ttl,
            subject,
        } => {
            let mesh = mesh.unwrap_or_else(|| config.node.mesh_id.clone());
            if mesh.trim().is_empty() {
                return Err(AtmoError::Config(
                    "no mesh id: pass --mesh or set node.mesh_id".into(),
                ));
            }
            let identity = Arc::new(super::load_identity(config)?);
            let issuer = TokenIssuer::founder(identity, mesh.as_str());
            let ttl = Duration::from_secs(ttl.unwrap_or(config.token.default_ttl_secs));
            let issued = issuer.try_issue(subject.as_deref(), &mesh, capabilities, ttl)?;
            println!("{}", issued.encoded);
            Ok(())
        }
        TokenAction::Verify {
            token,
            issuer_key,
            mesh,
        } => {
            let mesh = mesh.unwrap_or_else(|| config.node.mesh_id.clone());
            let outcome = verify(&token, &mesh, issuer_key.as_deref(), &config.token.trusted_issuers)?;
            match outcome.token {
                Some(ref claims) => print!("{}", render_claims(claims)),
                None => {
                    if let Some(reason) = outcome.reason {
                        println!("invalid: {reason}");
                    }
                }
            }
            outcome.into_result().map(|_| ())
        }
    }
}

fn verify(
    token: &str,
    mesh: &str,
    issuer_key: Option<&str>,
    trusted: &[String],
) -> Result<VerificationOutcome> {
    let verifier = TokenVerifier::new(mesh);
    Ok(match issuer_key {
        Some(key) => verifier.verify(token, &key.parse::<PublicKey>()?),
        None => verifier.verify_trusted(token, &TrustedIssuers::from_config(trusted)),
    })
}

fn render_claims(token: &MembershipToken) -> String {
    let caps: Vec<&str> = token.capabilities.iter().map(String::as_str).collect();
    let mut out = String::from("valid\n");
    out.push_str(&format!("  mesh:         {}\n", token.mesh_id));
    out.push_str(&format!(
        "  subject:      {}\n",
        token.subject_node_id.as_deref().unwrap_or("(bearer)")
    ));
    out.push_str(&format!("  issuer:       {}\n", token.issuer_id));
    out.push_str(&format!("  capabilities: {}\n", caps.join(", ")));
    out.push_str(&format!(
        "  expires in:   {}s\n",
        token.remaining_secs(unix_now())
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmo_core::TokenRejection;
    use atmo_identity::{IdentityStore, KeyAlgorithm, MemoryKeyStore};

    fn founder() -> (Arc<IdentityStore>, String) {
        let identity = Arc::new(IdentityStore::load_or_create(
            &MemoryKeyStore::new(),
            KeyAlgorithm::Ed25519,
        ));
        let key = identity.public_key().unwrap().to_string();
        (identity, key)
    }

    #[test]
    fn test_verify_with_explicit_key_and_roster() {
        let (identity, key) = founder();
        let issued = TokenIssuer::founder(identity, "home")
            .issue(Some("n1"), "home", ["member"], Duration::from_secs(60))
            .unwrap();

        let outcome = verify(&issued.encoded, "home", Some(&key), &[]).unwrap();
        assert!(outcome.valid);
        let text = render_claims(outcome.token.as_ref().unwrap());
        assert!(text.contains("member"));
        assert!(text.contains("n1"));

        let outcome = verify(&issued.encoded, "home", None, &[key.clone()]).unwrap();
        assert!(outcome.valid);

        let outcome = verify(&issued.encoded, "home", None, &[]).unwrap();
        assert_eq!(outcome.reason, Some(TokenRejection::UntrustedIssuer));

        let outcome = verify(&issued.encoded, "office", Some(&key), &[]).unwrap();
        assert_eq!(outcome.reason, Some(TokenRejection::WrongMesh));
    }

    #[test]
    fn test_bad_issuer_key_is_an_error() {
        assert!(verify("x.y", "home", Some("not-a-key"), &[]).is_err());
    }
}
