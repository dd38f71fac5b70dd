use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

use cipher_quests::config::DEFAULT_CONFIG_PATH;
use cipher_quests::quest::{redeem, CacheKey, QuestState, RedemptionOutcome};
use cipher_quests::session::{FileSessionStore, SessionStore, AUTH_USER_KEY};
use cipher_quests::signs::{save_reward, AuthoredReward, SignCatalog};
use cipher_quests::{AppConfig, SqliteBackend};

/// Quest redemption companion: sign cipher and quest progress
#[derive(Parser, Debug)]
#[command(name = "cipher-quests")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "CIPHER_QUESTS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the encoded sequence and reward key for placed signs
    Encode {
        keyword: String,
        #[arg(required = true)]
        signs: Vec<String>,
        /// Save the reward onto this quest
        #[arg(long)]
        quest: Option<String>,
    },
    /// Create an account and sign in
    Register { email: String, password: String },
    /// Sign in
    Login { email: String, password: String },
    /// Sign out and clear the session
    Logout,
    /// Show cache statistics
    Status,
    /// List your characters
    Characters,
    /// Create a character
    CreateCharacter { name: String },
    /// Switch the active character
    Use { character_id: String },
    /// Set the active character's archetype
    Archetype { name: String },
    /// Redeem a sign sequence
    Redeem {
        keyword: String,
        #[arg(required = true)]
        signs: Vec<String>,
    },
    /// Reload everything from the database
    Refresh,
}

type CliResult = Result<(), Box<dyn Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match AppConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                config
                    .log_filter
                    .parse()
                    .unwrap_or_else(|_| "cipher_quests=info".parse().unwrap()),
            ),
        )
        .init();

    if let Err(e) = run(&config, cli.command).await {
        error!("Command failed: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: &AppConfig, command: Command) -> CliResult {
    if let Command::Encode { keyword, signs, quest } = command {
        return encode(config, &keyword, signs, quest.as_deref()).await;
    }

    let backend = Arc::new(SqliteBackend::new(&config.database_url).await?);
    let session = Arc::new(FileSessionStore::open(&config.session_path));

    if let Some(user_id) = session.get(AUTH_USER_KEY) {
        if backend.restore_session(&user_id).await?.is_none() {
            info!("Stored session for {} is no longer valid", user_id);
            session.remove(AUTH_USER_KEY);
        }
    }

    let state = QuestState::new(backend.clone(), session.clone());
    let _events = state.subscribe(|event| debug!("Quest state event: {}", event.name()));

    match command {
        Command::Encode { .. } => {}
        Command::Register { email, password } => {
            let user = backend.register(&email, &password).await?;
            session.set(AUTH_USER_KEY, &user.id);
            println!("Registered and signed in as {}", email);
        }
        Command::Login { email, password } => {
            let user = backend.sign_in(&email, &password).await?;
            session.set(AUTH_USER_KEY, &user.id);
            println!("Signed in as {}", email);
        }
        Command::Logout => {
            backend.sign_out();
            state.reset();
            session.remove(AUTH_USER_KEY);
            println!("Signed out");
        }
        Command::Status => {
            state.initialize().await?;
            println!("{}", serde_json::to_string_pretty(&state.cache_stats())?);
            if let Some(character) = state.active_character() {
                println!(
                    "Active character: {} ({})",
                    character.character_name, character.character_id
                );
            }
            let unlocked: Vec<String> = state.unlocked_categories().into_iter().collect();
            println!("Unlocked categories: {}", unlocked.join(", "));
        }
        Command::Characters => {
            state.initialize().await?;
            let active = state.active_character_id();
            for character in state.characters() {
                let marker = if active.as_deref() == Some(character.character_id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!(
                    "{} {}  {}  {}",
                    marker,
                    character.character_id,
                    character.character_name,
                    character.archetype.as_deref().unwrap_or("-")
                );
            }
        }
        Command::CreateCharacter { name } => {
            state.initialize().await?;
            let character = state.add_character(&name).await?;
            println!("Created {} ({})", character.character_name, character.character_id);
        }
        Command::Use { character_id } => {
            state.initialize().await?;
            if !state.characters().iter().any(|c| c.character_id == character_id) {
                return Err(format!("no character {} on this account", character_id).into());
            }
            state.set_active_character(&character_id).await?;
            println!("Now playing as {}", character_id);
        }
        Command::Archetype { name } => {
            state.initialize().await?;
            state.set_character_archetype(&name, None).await?;
            println!("Archetype set to {}", name);
        }
        Command::Redeem { keyword, signs } => {
            let catalog = SignCatalog::load(&config.signs_path)?;
            state.initialize().await?;
            match redeem(&state, &catalog, &signs, &keyword).await? {
                RedemptionOutcome::SecretCategoryUnlocked { category_name, message } => {
                    println!("Secret Archive Accessed: {} ({})", message, category_name)
                }
                RedemptionOutcome::AlreadyUnlocked { category_name } => {
                    println!("Already Unlocked: {}", category_name)
                }
                RedemptionOutcome::QuestClaimed { quest_name, .. } => {
                    println!("Quest Deciphered: you have completed {}", quest_name)
                }
                RedemptionOutcome::AlreadyClaimed { .. } => {
                    println!("This character has already redeemed this quest.")
                }
                RedemptionOutcome::NoMatch => {
                    println!("The sequence or keyword provided is incorrect.")
                }
            }
        }
        Command::Refresh => {
            state.initialize().await?;
            state
                .invalidate(&[
                    CacheKey::Quests,
                    CacheKey::Regions,
                    CacheKey::Categories,
                    CacheKey::Characters,
                    CacheKey::CharacterData,
                ])
                .await?;
            println!("{}", serde_json::to_string_pretty(&state.cache_stats())?);
        }
    }

    Ok(())
}

async fn encode(
    config: &AppConfig,
    keyword: &str,
    placed: Vec<String>,
    quest_id: Option<&str>,
) -> CliResult {
    let catalog = SignCatalog::load(&config.signs_path)?;
    let reward = AuthoredReward::new(placed, keyword, &catalog)?;

    for step in reward.steps() {
        println!(
            "{:<24} -> {:<24} {:<16} {}",
            step.placed,
            step.encoded,
            step.label,
            catalog.image_url(&step.encoded)
        );
    }
    println!("reward key: {}", reward.reward_key);

    // Only saving touches the database
    if let Some(quest_id) = quest_id {
        let backend = SqliteBackend::new(&config.database_url).await?;
        save_reward(&backend, quest_id, &reward).await?;
        println!("Saved to quest {}", quest_id);
    }
    Ok(())
}
