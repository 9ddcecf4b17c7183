use std::sync::Arc;

use anyhow::{anyhow, Context};
use campus_client::routes::call_room_path;
use campus_client::sdk::loopback::LoopbackSdk;
use campus_client::{
    CallUser, ClientConfig, GatewayApi, History, JoinCoordinator, JoinPhase, LogNotifier,
    Navigator, SessionStore, VideoCallApi,
};
use campus_common::{CreateVideoCallRequest, VideoCall, VideoCallQuery};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "campus-call", about = "Campus video-call client")]
struct Args {
    /// Gateway base URL
    #[arg(long, env = "CAMPUS_GATEWAY_URL", default_value = "http://127.0.0.1:3000")]
    gateway: String,
    /// Session token from a previous `login`
    #[arg(long, env = "CAMPUS_SESSION_TOKEN")]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and print the session token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "CAMPUS_PASSWORD")]
        password: String,
    },
    /// List video calls visible to the signed-in user
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        lesson: Option<String>,
    },
    Show {
        id: String,
    },
    /// Start a call for a lesson (professors and admins)
    Start {
        #[arg(long)]
        lesson: String,
        #[arg(long)]
        course: String,
        #[arg(long)]
        title: String,
        #[arg(long = "type")]
        call_type: Option<String>,
    },
    /// Request a join token
    Token {
        id: String,
    },
    End {
        id: String,
    },
    Cancel {
        id: String,
    },
    /// Join a call and stay in it until Ctrl-C
    Join {
        id: String,
        /// Use the in-process video SDK
        #[arg(long, default_value_t = false)]
        loopback: bool,
        /// Sign in first instead of reusing the session token
        #[arg(long, requires = "password")]
        email: Option<String>,
        #[arg(long, env = "CAMPUS_PASSWORD")]
        password: Option<String>,
    },
}

fn print_call(call: &VideoCall) {
    println!(
        "{}  {:<9}  {}  {}  participants={}",
        call.id,
        call.status.as_str(),
        call.call_cid,
        call.title,
        call.present_participants()
    );
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Signs in with the given credentials, or resolves the account behind the
/// session token already configured.
async fn sign_in(
    api: &mut GatewayApi,
    email: Option<&str>,
    password: Option<&str>,
    has_token: bool,
) -> anyhow::Result<CallUser> {
    let account = match (email, password) {
        (Some(email), Some(password)) => {
            api.login(email, password).await.context("login failed")?.user
        }
        _ if has_token => api.me().await.context("session token rejected")?,
        _ => {
            return Err(anyhow!(
                "pass --email and --password, or a session token via --token"
            ))
        }
    };
    let user = CallUser::from(&account);
    info!(user = %user.id, role = %user.role, "signed in");
    Ok(user)
}

async fn join(api: GatewayApi, id: &str, loopback: bool, user: CallUser) -> anyhow::Result<()> {
    if !loopback {
        return Err(anyhow!(
            "no video SDK backend available; pass --loopback to use the in-process SDK"
        ));
    }

    let api = Arc::new(api);
    let store = Arc::new(SessionStore::new());
    let history = Arc::new(History::new("/dashboard"));
    let coordinator = JoinCoordinator::new(
        api.clone(),
        Arc::new(LoopbackSdk::new()),
        store.clone(),
        history.clone(),
        Arc::new(LogNotifier),
    );
    coordinator.user_changed(Some(user));

    history.navigate(&call_room_path(id));
    coordinator.route_changed();
    store.set_call_page_active(true);
    let call = api.get_call(id).await?;
    coordinator.call_fetched(call);
    coordinator.settle().await;

    if coordinator.phase() != JoinPhase::Joined {
        return Err(anyhow!("could not join video call {id}"));
    }
    let snapshot = store.snapshot();
    info!(
        call_cid = snapshot.call_cid().unwrap_or_default(),
        role = ?snapshot.role,
        "in call; press Ctrl-C to leave"
    );

    tokio::signal::ctrl_c().await?;
    coordinator.leave().await;
    info!(path = %history.current_path(), "left call");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    campus_common::init_tracing();
    let args = Args::parse();

    let has_token = args.token.is_some();
    let mut config = ClientConfig::new(&args.gateway)?;
    if let Some(token) = args.token {
        config = config.with_session_token(token);
    }
    let mut api = GatewayApi::new(&config);

    match args.command {
        Command::Login { email, password } => {
            let auth = api.login(&email, &password).await?;
            println!("{}", auth.token);
            info!(user = %auth.user.id, expires_at = %auth.expires_at, "signed in");
        }
        Command::List {
            status,
            course,
            lesson,
        } => {
            let query = VideoCallQuery {
                status,
                course_id: course,
                lesson_id: lesson,
            };
            for call in api.list_calls(&query).await? {
                print_call(&call);
            }
        }
        Command::Show { id } => print_json(&api.get_call(&id).await?)?,
        Command::Start {
            lesson,
            course,
            title,
            call_type,
        } => {
            let request = CreateVideoCallRequest {
                lesson_id: lesson,
                course_id: course,
                title,
                call_type,
                lesson_start_at: None,
                lesson_end_at: None,
            };
            print_call(&api.start_call(&request).await?);
        }
        Command::Token { id } => print_json(&api.request_token(&id).await?)?,
        Command::End { id } => print_call(&api.end_call(&id).await?),
        Command::Cancel { id } => print_call(&api.cancel_call(&id).await?),
        Command::Join {
            id,
            loopback,
            email,
            password,
        } => {
            let user = sign_in(&mut api, email.as_deref(), password.as_deref(), has_token).await?;
            join(api, &id, loopback, user).await?
        }
    }

    Ok(())
}
