use std::env;
use std::error::Error;

use securechat_sdk::{
    ConversationPlan, Endpoint, Identity, SessionConfig, SessionOrchestrator, SignInFlow, UserId,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let host = env::var("SECURECHAT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = match env::var("SECURECHAT_PORT") {
        Ok(port) => port.parse()?,
        Err(_) => 5000,
    };

    // Key material is produced by the caller's crypto layer; these are
    // placeholders the service stores as-is.
    let plan = ConversationPlan {
        identity: Identity::new("alice", "REPLACE_WITH_PASSWORD", b"REPLACE_WITH_PUBLIC_KEY".to_vec()),
        flow: SignInFlow::RegisterThenLogin,
        receiver_id: UserId(1),
        sender_encrypted_key: b"REPLACE_WITH_SENDER_ENCRYPTED_AES_KEY".to_vec(),
        receiver_encrypted_key: b"REPLACE_WITH_RECEIVER_ENCRYPTED_AES_KEY".to_vec(),
        messages: vec![b"REPLACE_WITH_CIPHERTEXT".to_vec()],
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let orchestrator = SessionOrchestrator::new(SessionConfig::new(Endpoint::new(host, port)))?;
        let report = orchestrator
            .run(plan, |message| {
                println!(
                    "seq={} chat_id={} sender_id={} bytes={}",
                    message.sequence,
                    message.chat_id,
                    message.sender_id,
                    message.encrypted_content.len()
                );
            })
            .await?;
        println!(
            "chat_id={} sent={} state={:?}",
            report.chat.id, report.sent, report.state
        );

        Ok::<(), Box<dyn Error>>(())
    })
}
