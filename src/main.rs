mod cli;

use cdp_ctl::cdp::{Cancel, Connection, EventStream, SessionManager};
use cdp_ctl::error::{Error, ErrorPayload};
use cdp_ctl::ops;
use clap::Parser;
use cli::{Args, Command};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args.log_level);
    std::process::exit(run(args).await);
}

fn init_tracing(log_level: &str) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr) // keep stdout clean for result JSON
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(false)
                .compact(),
        )
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();
}

async fn run(args: Args) -> i32 {
    let connection = match Connection::connect(&args.chrome_host, args.chrome_port).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to connect to chrome");
            return 2;
        }
    };

    let shutdown_conn = connection.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, closing connection");
            shutdown_conn.close().await;
        }
    });

    let sessions = SessionManager::new(connection.clone());
    let cancel = Cancel::none();

    let code = match dispatch(&connection, &sessions, &args, &cancel).await {
        Ok(()) => 0,
        Err(e) => {
            let payload = ErrorPayload::from(&e);
            eprintln!("{}", serde_json::to_string(&payload).unwrap_or_else(|_| e.to_string()));
            e.exit_code()
        }
    };

    connection.close().await;
    code
}

/// Resolve the session to operate on: the explicit `--target`, or the
/// first page target if none was given.
async fn resolve_session(sessions: &SessionManager, target: Option<&str>) -> Result<String, Error> {
    let target_id = match target {
        Some(id) => id.to_string(),
        None => {
            let pages = sessions.pages().await?;
            pages
                .into_iter()
                .next()
                .map(|p| p.target_id)
                .ok_or_else(|| Error::not_found("no page target"))?
        }
    };
    sessions.attach(&target_id).await
}

fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string()));
}

async fn dispatch(connection: &Connection, sessions: &SessionManager, args: &Args, cancel: &Cancel) -> Result<(), Error> {
    macro_rules! session {
        () => {
            resolve_session(sessions, args.target.as_deref()).await?
        };
    }

    match &args.command {
        Command::Tabs => print_json(&sessions.pages().await?),
        Command::NewTab { url } => print_json(&ops::page::new_tab(sessions, url.as_deref()).await?),
        Command::CloseTab { target_id } => print_json(&ops::page::close_tab(sessions, target_id).await?),

        Command::Navigate { url, wait } => {
            let s = session!();
            let result = if *wait {
                ops::page::navigate_and_wait(connection, &s, url, cancel).await?
            } else {
                ops::page::navigate(connection, &s, url, cancel).await?
            };
            print_json(&result);
        }
        Command::Back => print_json(&ops::page::go_back(connection, &session!(), cancel).await?),
        Command::Forward => print_json(&ops::page::go_forward(connection, &session!(), cancel).await?),
        Command::Reload { ignore_cache } => {
            print_json(&ops::page::reload(connection, &session!(), *ignore_cache, cancel).await?);
        }
        Command::Source => print_json(&ops::page::source(connection, &session!(), cancel).await?),
        Command::Info => print_json(&ops::page::info(connection, &session!(), cancel).await?),

        Command::Click { selector } => print_json(&ops::input::click(connection, &session!(), selector, cancel).await?),
        Command::Doubleclick { selector } => {
            print_json(&ops::input::doubleclick(connection, &session!(), selector, cancel).await?);
        }
        Command::Tripleclick { selector } => {
            print_json(&ops::input::tripleclick(connection, &session!(), selector, cancel).await?);
        }
        Command::Rightclick { selector } => {
            print_json(&ops::input::rightclick(connection, &session!(), selector, cancel).await?);
        }
        Command::Clickat { x, y } => print_json(&ops::input::clickat(connection, &session!(), *x, *y, cancel).await?),
        Command::Drag { src, dst } => print_json(&ops::input::drag(connection, &session!(), src, dst, cancel).await?),
        Command::Tap { selector } => print_json(&ops::input::tap(connection, &session!(), selector, cancel).await?),
        Command::Swipe { selector, direction } => {
            print_json(&ops::input::swipe(connection, &session!(), selector, direction, cancel).await?);
        }
        Command::Pinch { selector, direction } => {
            print_json(&ops::input::pinch(connection, &session!(), selector, direction, cancel).await?);
        }
        Command::Presskey { key, modifiers } => {
            print_json(&ops::input::presskey(connection, &session!(), key, modifiers, cancel).await?);
        }
        Command::Type { text } => print_json(&ops::input::type_text(connection, &session!(), text, cancel).await?),
        Command::Fill { selector, text } => {
            print_json(&ops::input::fill(connection, &session!(), selector, text, cancel).await?);
        }
        Command::Clear { selector } => print_json(&ops::input::clear(connection, &session!(), selector, cancel).await?),
        Command::Setvalue { selector, value } => {
            print_json(&ops::input::setvalue(connection, &session!(), selector, value, cancel).await?);
        }
        Command::Select { selector, value } => {
            print_json(&ops::input::select(connection, &session!(), selector, value, cancel).await?);
        }
        Command::Check { selector } => print_json(&ops::input::check(connection, &session!(), selector, cancel).await?),
        Command::Uncheck { selector } => print_json(&ops::input::uncheck(connection, &session!(), selector, cancel).await?),
        Command::Upload { selector, files } => {
            print_json(&ops::input::upload(connection, &session!(), selector, files, cancel).await?);
        }
        Command::Dispatch { selector, event_type } => {
            print_json(&ops::input::dispatch(connection, &session!(), selector, event_type, cancel).await?);
        }

        Command::Query { selector } => print_json(&ops::dom::query(connection, &session!(), selector, cancel).await?),
        Command::Attr { selector, name } => {
            print_json(&ops::dom::attr(connection, &session!(), selector, name, cancel).await?);
        }
        Command::Shadow { host, inner } => {
            print_json(&ops::dom::shadow(connection, &session!(), host, inner, cancel).await?);
        }

        Command::Screenshot { selector, format, quality } => {
            let s = session!();
            let result = match selector {
                Some(sel) => ops::page::screenshot_element(connection, &s, sel, format.as_deref(), *quality, cancel).await?,
                None => ops::page::screenshot(connection, &s, format.as_deref(), *quality, cancel).await?,
            };
            print_json(&serde_json::json!({ "bytes": result.data.len() }));
        }
        Command::Pdf => {
            let result = ops::page::pdf(connection, &session!(), None, cancel).await?;
            print_json(&serde_json::json!({ "bytes": result.data.len() }));
        }
        Command::Viewport { width, height, scale, mobile } => {
            print_json(&ops::page::viewport(connection, &session!(), *width, *height, *scale, *mobile, cancel).await?);
        }
        Command::UserAgent { value } => {
            print_json(&ops::page::set_user_agent(connection, &session!(), value, cancel).await?);
        }
        Command::Emulate { device } => print_json(&ops::page::emulate(connection, &session!(), device, cancel).await?),
        Command::Media { feature } => {
            let features = cli::parse_media_features(feature);
            print_json(&ops::page::media(connection, &session!(), &features, cancel).await?);
        }
        Command::Scrollto { selector } => print_json(&ops::page::scrollto(connection, &session!(), selector, cancel).await?),
        Command::Scrolltop => print_json(&ops::page::scrolltop(connection, &session!(), cancel).await?),
        Command::Scrollbottom => print_json(&ops::page::scrollbottom(connection, &session!(), cancel).await?),
        Command::Scroll { dx, dy } => print_json(&ops::page::scroll(connection, &session!(), *dx, *dy, cancel).await?),

        Command::Cookies { set, domain, delete, clear } => {
            let s = session!();
            if *clear {
                print_json(&ops::storage::clear_cookies(connection, &s, cancel).await?);
            } else if let Some(name) = delete {
                print_json(&ops::storage::delete_cookies(connection, &s, name, domain.as_deref(), None, cancel).await?);
            } else if let Some(kv) = set {
                let (name, value) = kv.split_once('=').ok_or_else(|| Error::invalid_argument("expected name=value"))?;
                let set_args = ops::storage::SetCookieArgs {
                    name: name.to_string(),
                    value: value.to_string(),
                    domain: domain.clone(),
                    ..Default::default()
                };
                print_json(&ops::storage::set_cookie(connection, &s, &set_args, cancel).await?);
            } else {
                print_json(&ops::storage::cookies(connection, &s, cancel).await?);
            }
        }
        Command::Storage { key, value, session, clear } => {
            let s = session!();
            if *clear {
                ops::storage::storage_clear(connection, &s, *session, cancel).await?;
                print_json(&serde_json::json!({ "cleared": true }));
            } else if let (Some(k), Some(v)) = (key, value) {
                print_json(&ops::storage::storage_set(connection, &s, k, v, *session, cancel).await?);
            } else if let Some(k) = key {
                print_json(&ops::storage::storage_get(connection, &s, k, *session, cancel).await?);
            } else {
                return Err(Error::invalid_argument("storage requires a key"));
            }
        }
        Command::Permission { name, setting } => {
            print_json(&ops::storage::set_permission(connection, &session!(), name, setting, cancel).await?);
        }
        Command::Geolocation { latitude, longitude } => {
            print_json(&ops::storage::set_geolocation(connection, &session!(), *latitude, *longitude, cancel).await?);
        }
        Command::Clipboard { read, write } => {
            let s = session!();
            if let Some(text) = write {
                print_json(&ops::storage::clipboard_write(connection, &s, text, cancel).await?);
            } else if *read {
                print_json(&ops::storage::clipboard_read(connection, &s, cancel).await?);
            } else {
                return Err(Error::invalid_argument("clipboard requires --read or --write"));
            }
        }
        Command::Dialog { accept, prompt_text } => {
            print_json(&ops::storage::handle_dialog(connection, &session!(), *accept, prompt_text.as_deref(), cancel).await?);
        }

        Command::Wait { selector, timeout } => {
            print_json(&ops::wait::wait(connection, &session!(), selector, cli::secs(*timeout), cancel).await?);
        }
        Command::Waitgone { selector, timeout } => {
            print_json(&ops::wait::waitgone(connection, &session!(), selector, cli::secs(*timeout), cancel).await?);
        }
        Command::Waittext { text, timeout } => {
            print_json(&ops::wait::waittext(connection, &session!(), text, cli::secs(*timeout), cancel).await?);
        }
        Command::Waitfn { expression, timeout } => {
            print_json(&ops::wait::waitfn(connection, &session!(), expression, cli::secs(*timeout), cancel).await?);
        }
        Command::Waiturl { pattern, timeout } => {
            print_json(&ops::wait::waiturl(connection, &session!(), pattern, cli::secs(*timeout), cancel).await?);
        }
        Command::Waitnav { timeout } => {
            print_json(&ops::wait::waitnav(connection, &session!(), cli::secs(*timeout), cancel).await?);
        }
        Command::Waitload { timeout } => {
            print_json(&ops::wait::waitload(connection, &session!(), cli::secs(*timeout), cancel).await?);
        }
        Command::Waitrequest { pattern, timeout } => {
            print_json(&ops::wait::waitrequest(connection, &session!(), pattern, cli::secs(*timeout), cancel).await?);
        }
        Command::Waitresponse { pattern, timeout } => {
            print_json(&ops::wait::waitresponse(connection, &session!(), pattern, cli::secs(*timeout), cancel).await?);
        }
        Command::Waitidle { idle_ms, timeout } => {
            let idle = std::time::Duration::from_millis(*idle_ms);
            print_json(&ops::wait::waitidle(connection, &session!(), idle, cli::secs(*timeout), cancel).await?);
        }

        Command::Console { duration } => {
            let s = session!();
            let mut stream = cdp_ctl::cdp::console(connection, &s).await?;
            stream_typed(&mut stream, *duration).await;
        }
        Command::Errors { duration } => {
            let s = session!();
            let mut stream = cdp_ctl::cdp::exceptions(connection, &s).await?;
            stream_typed(&mut stream, *duration).await;
        }
        Command::Network { duration } => {
            let s = session!();
            let mut stream = cdp_ctl::cdp::network(connection, &s).await?;
            stream_typed(&mut stream, *duration).await;
        }

        Command::Block { patterns, disable } => {
            let s = session!();
            let effective: Vec<String> = if *disable { Vec::new() } else { patterns.clone() };
            print_json(&ops::network::block_urls(connection, &s, &effective, cancel).await?);
        }
        Command::Throttle { preset, disable } => {
            let s = session!();
            if *disable {
                print_json(&ops::network::throttle_disable(connection, &s, cancel).await?);
            } else {
                let name = preset.as_deref().ok_or_else(|| Error::invalid_argument("throttle requires a preset name"))?;
                print_json(&ops::network::throttle(connection, &s, name, cancel).await?);
            }
        }
        Command::Offline { on } => print_json(&ops::network::set_offline(connection, &session!(), *on, cancel).await?),
        Command::Responsebody { request_id } => {
            print_json(&ops::network::response_body(connection, &session!(), request_id, cancel).await?);
        }
        Command::Har { duration } => {
            let doc = ops::network::har(connection, &session!(), cli::secs(*duration), cancel).await?;
            print_json(&doc);
        }
    }
    Ok(())
}

/// Drains a typed event stream to stdout as NDJSON. `duration_secs == 0`
/// means run until the stream itself closes (e.g. connection shutdown).
async fn stream_typed<T: Serialize>(stream: &mut EventStream<T>, duration_secs: u64) {
    if duration_secs == 0 {
        while let Some(event) = stream.next().await {
            print_json(&event);
        }
        return;
    }
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(duration_secs);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            event = stream.next() => {
                match event {
                    Some(e) => print_json(&e),
                    None => break,
                }
            }
            () = tokio::time::sleep(remaining) => break,
        }
    }
    stream.stop().await;
}
