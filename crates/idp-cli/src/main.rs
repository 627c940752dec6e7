use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use idp_session_core::config::ConfigLocator;
use idp_session_core::http::ApiResponse;
use idp_session_core::{Session, SessionConfig, SessionError};
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Identity provider session CLI")]
struct Cli {
    /// Profile name for stored credentials (overrides IDP_PROFILE)
    #[arg(long, global = true)]
    profile: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign in with email and password
    Login(LoginArgs),
    /// Exchange an authorization code for an access token
    Exchange(ExchangeArgs),
    /// Clear the stored credential and end the remote session
    Logout,
    /// Check whether the stored credential is still accepted
    Session,
    /// Send an authenticated GET request
    Get(GetArgs),
    /// Send an authenticated POST request
    Post(PostArgs),
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long, env = "IDP_EMAIL")]
    email: String,
    #[arg(long, env = "IDP_PASSWORD", hide_env_values = true)]
    password: String,
    /// Do not exchange the authorization code returned by the login redirect
    #[arg(long = "no-exchange")]
    no_exchange: bool,
}

#[derive(Args, Debug)]
struct ExchangeArgs {
    /// Authorization code or the full redirect URL carrying it
    code: String,
}

#[derive(Args, Debug)]
struct GetArgs {
    /// API path relative to IDP_API_BASE_URL
    path: String,
}

#[derive(Args, Debug)]
struct PostArgs {
    /// API path relative to IDP_API_BASE_URL
    path: String,
    /// JSON request body
    #[arg(long, default_value = "{}")]
    json: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let session = build_session(cli.profile)?;

    match cli.command {
        Commands::Login(args) => login(&session, args).await?,
        Commands::Exchange(args) => exchange(&session, args).await?,
        Commands::Logout => {
            session.logout().await.context("logout failed")?;
            println!("Logged out.");
        }
        Commands::Session => validate(&session).await?,
        Commands::Get(args) => {
            let response = session.get(&args.path).await.map_err(api_error)?;
            print_body(&response);
        }
        Commands::Post(args) => {
            let body: Value =
                serde_json::from_str(&args.json).context("--json is not valid JSON")?;
            let response = session.post(&args.path, body).await.map_err(api_error)?;
            print_body(&response);
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_session(profile: Option<String>) -> Result<Session> {
    let mut config = SessionConfig::from_env().context("invalid IDP_* configuration")?;
    if let Some(profile) = profile {
        config.profile = profile;
    }
    debug!(base_url = %config.base_url, profile = %config.profile, "building session");
    let locator = ConfigLocator::new().context("unable to locate configuration directory")?;
    Session::persistent(config, locator).context("unable to open stored session")
}

async fn login(session: &Session, args: LoginArgs) -> Result<()> {
    let outcome = session.login(&args.email, &args.password).await?;

    if outcome.credential.is_some() {
        println!("Login succeeded. Access token stored.");
        return Ok(());
    }

    match (outcome.authorization_code(), &outcome.redirect_to) {
        (Some(code), _) if !args.no_exchange => {
            session
                .exchange_code(&code)
                .await
                .context("authorization code exchange failed")?;
            println!("Login succeeded. Access token stored.");
        }
        (_, Some(redirect)) => println!("Continue at {redirect}"),
        _ => return Err(anyhow!("login response carried no continuation")),
    }
    Ok(())
}

async fn exchange(session: &Session, args: ExchangeArgs) -> Result<()> {
    let code = match url::Url::parse(&args.code) {
        Ok(url) => url
            .query_pairs()
            .find(|(key, _)| key == "code")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| anyhow!("redirect URL has no `code` parameter"))?,
        Err(_) => args.code,
    };
    session
        .exchange_code(&code)
        .await
        .context("authorization code exchange failed")?;
    println!("Access token stored.");
    Ok(())
}

async fn validate(session: &Session) -> Result<()> {
    match session.validate_session().await {
        Ok(status) => {
            match status.user_id {
                Some(user) => println!("Session valid for user {user}."),
                None => println!("Session valid."),
            }
            Ok(())
        }
        Err(err) => {
            session
                .logout()
                .await
                .context("failed to clear local session")?;
            Err(anyhow!(err).context("session is no longer valid; please log in again"))
        }
    }
}

fn api_error(err: SessionError) -> anyhow::Error {
    if err.requires_login() {
        anyhow!(err).context("not signed in; run `idp login`")
    } else {
        anyhow!(err)
    }
}

fn print_body(response: &ApiResponse) {
    match serde_json::from_str::<Value>(&response.body) {
        Ok(json) => match serde_json::to_string_pretty(&json) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{}", response.body),
        },
        Err(_) => println!("{}", response.body),
    }
}
