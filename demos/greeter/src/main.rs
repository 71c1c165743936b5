//! Greeter Demo
//!
//! Hosts a small greeting skill on an in-process bus and replays
//! utterances through it. There is no intent service here, so a naive
//! keyword check stands in for one: utterances containing "hello" are sent
//! to the skill's `hello` intent and everything else goes to the fallback
//! chain via `intent_failure`.
//!
//! # Usage
//!
//! ```bash
//! cargo run --package greeter -- --say "hello there" --say "what time is it" --once
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use murmur::prelude::*;
use murmur::runtime::ConfigLoader;
use serde_json::json;

#[derive(Debug, Parser)]
#[command(about = "Replay utterances through a greeting skill")]
struct Args {
    /// Configuration file; the default locations are searched when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Utterance to replay. May be given more than once.
    #[arg(short, long)]
    say: Vec<String>,

    /// Exit after replaying instead of waiting for Ctrl+C.
    #[arg(long)]
    once: bool,
}

struct Greeter;

#[async_trait]
impl SkillBehavior for Greeter {
    fn declare(&self, decl: &mut Declarations) {
        decl.intent(
            IntentBuilder::new("hello").require("HelloKeyword"),
            |skill: Skill, msg: Message| async move {
                let name = msg.get_str("name").unwrap_or("friend").to_string();
                skill.speak(format!("Hello, {name}!"), false).await
            },
        );
    }

    async fn initialize(&self, skill: &Skill) -> Result<(), BoxError> {
        skill.register_vocabulary("hello", "HelloKeyword").await?;
        skill.register_vocabulary("hi", "HelloKeyword").await?;

        let bus = skill.bus();
        let apology = FallbackHandler::named("not_understood", move |msg: Message| {
            let bus = bus.clone();
            async move {
                let utterance = msg.get_str("utterance").unwrap_or_default().to_string();
                let Some(bus) = bus else {
                    return false;
                };
                let reply = Message::new(
                    topic::SPEAK,
                    json!({
                        "utterance": format!("Sorry, I don't know how to answer \"{utterance}\"."),
                        "expect_response": false,
                    }),
                );
                bus.emit(reply).await.is_ok()
            }
        });
        skill.register_fallback(apology, 90)?;
        Ok(())
    }

    async fn stop(&self, skill: &Skill) -> Result<(), BoxError> {
        info!(skill = %skill.name(), "Greeter stopping");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let bus: BoxedBus = Arc::new(LocalBus::new());

    let runtime = match &args.config {
        Some(path) => MurmurRuntime::from_config(bus.clone(), ConfigLoader::new().file(path).load()?),
        None => MurmurRuntime::new(bus.clone()),
    };

    bus.on(
        topic::SPEAK,
        murmur::core::bus_handler(|msg: Message| async move {
            if let Some(text) = msg.get_str("utterance") {
                info!("🗣  {text}");
            }
        }),
    );

    let greeter = runtime.load_skill("greeter", Greeter).await?;
    runtime.start().await?;

    let hello = greeter.namespaced("hello")?;
    for utterance in &args.say {
        let payload = json!({ "utterance": utterance, "lang": runtime.config().lang });
        let target = if utterance.to_lowercase().contains("hello") {
            hello.as_str()
        } else {
            topic::INTENT_FAILURE
        };
        debug!(utterance = %utterance, event = target, "Replaying utterance");
        bus.emit(Message::new(target, payload)).await?;
    }

    if args.once {
        runtime.stop().await?;
    } else {
        info!("Press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
        runtime.stop().await?;
    }

    Ok(())
}
