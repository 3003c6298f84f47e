//! Demo wiring of the full stack: event loop, TCP connection manager and a
//! server-side SecureChannel per connection. Every MSG body is echoed back
//! on the same request id.

use clap::Parser;
use sloggers::types::Severity;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use uabase::logging::{self, Logger};
use uabase::security::{PolicyNone, SecurityPolicy};
use uabase::types::{ByteString, NodeId};
use uastack::channel::{
    ChannelRole, SecureChannel, SecureChannelState, SecurityMode, SecurityToken,
};
use uastack::eventloop::{EventLoop, EventLoopState};
use uastack::frame::MessageType;
use uastack::tcp::{
    connection_callback, ConnectionId, ConnectionState, OpenParams, TcpConnectionManager,
};
use util::ServerConfig;

#[derive(Parser)]
#[command(about = "Secure-channel echo server")]
struct Args {
    /// Path to a TOML config file; defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    /// trace, debug, info, warning, error or critical.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn severity(name: &str) -> Severity {
    match name {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    }
}

type Sessions = Rc<RefCell<HashMap<ConnectionId, SecureChannel>>>;

fn main() {
    let args = Args::parse();
    let log = logging::term_logger(severity(&args.log_level));

    let config: ServerConfig = match &args.config {
        Some(path) => match serdeconv::from_toml_file(path) {
            Ok(config) => config,
            Err(err) => {
                logging::error!(log, "could not read the config file"; "error" => %err);
                process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    let mut el = match EventLoop::new(log.clone()) {
        Ok(el) => el,
        Err(code) => {
            logging::crit!(log, "could not create the event loop"; "status" => %code);
            process::exit(1);
        }
    };

    let cm = TcpConnectionManager::new("tcp", config.tcp.clone(), log.clone());
    let source_id = match el.register_event_source(Box::new(cm)) {
        Ok(source_id) => source_id,
        Err(code) => {
            logging::crit!(log, "could not register the connection manager"; "status" => %code);
            process::exit(1);
        }
    };
    if let Err(code) = el.start() {
        logging::crit!(log, "could not start the event loop"; "status" => %code);
        process::exit(1);
    }

    let sessions: Sessions = Rc::new(RefCell::new(HashMap::new()));
    let policies: Vec<Rc<dyn SecurityPolicy>> = vec![Rc::new(PolicyNone::new())];
    let next_channel_id = Rc::new(RefCell::new(1u32));
    let channel_config = config.channel.clone();

    let cb_sessions = Rc::clone(&sessions);
    let cb_next_id = Rc::clone(&next_channel_id);
    let cb_log = log.clone();
    let callback = connection_callback(move |cm, el, id, state, params, payload| {
        match state {
            ConnectionState::Established if params.listen_address.is_some() => {
                logging::info!(cb_log, "listening";
                               "address" => ?params.listen_address,
                               "port" => params.listen_port.unwrap_or(0));
            }
            ConnectionState::Established if payload.is_empty() => {
                let channel = SecureChannel::new(
                    ChannelRole::Server,
                    policies.clone(),
                    SecurityMode::None,
                    channel_config.clone(),
                    cb_log.clone(),
                );
                cb_sessions.borrow_mut().insert(id, channel);
            }
            ConnectionState::Established => {
                handle_data(cm, el, id, payload, &cb_sessions, &cb_next_id, &cb_log);
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                if let Some(mut channel) = cb_sessions.borrow_mut().remove(&id) {
                    channel.handle_disconnect();
                }
            }
            ConnectionState::Opening => {}
        }
    });

    let port = config.port;
    let opened = el.with_source(source_id, move |source, el| {
        match source.as_any_mut().downcast_mut::<TcpConnectionManager>() {
            Some(cm) => cm.open_connection(el, &OpenParams::listen(port), callback),
            None => Err(uabase::status::StatusCode::BAD_INTERNAL_ERROR),
        }
    });
    if !matches!(opened, Some(Ok(()))) {
        logging::crit!(log, "could not open the listen socket"; "port" => port);
        process::exit(1);
    }

    logging::info!(log, "echo server running"; "port" => port);

    loop {
        if el.run(200).is_err() {
            break;
        }
        if el.state() == EventLoopState::Stopped {
            break;
        }
    }
}

fn handle_data(
    cm: &mut TcpConnectionManager,
    el: &mut EventLoop,
    id: ConnectionId,
    payload: &[u8],
    sessions: &Sessions,
    next_channel_id: &Rc<RefCell<u32>>,
    log: &Logger,
) {
    let mut map = sessions.borrow_mut();
    let channel = match map.get_mut(&id) {
        Some(channel) => channel,
        None => return,
    };
    let now = el.now_monotonic();

    match channel.process(payload, now) {
        Ok(messages) => {
            for message in messages {
                match message.message_type {
                    MessageType::Opn => {
                        // a renewal keeps the channel id and only bumps the
                        // token id; a fresh id is minted for the first open
                        let channel_id = if channel.state() == SecureChannelState::Open {
                            channel.current_token().channel_id
                        } else {
                            let mut next = next_channel_id.borrow_mut();
                            let channel_id = *next;
                            *next += 1;
                            channel_id
                        };
                        let token = SecurityToken {
                            channel_id,
                            token_id: channel.current_token().token_id + 1,
                            created_at: now,
                            revised_lifetime_ms: 600_000,
                        };
                        let mut opened = channel.generate_local_nonce().map(|_| ());
                        if opened.is_ok() {
                            opened = channel.complete_open(token, ByteString::null(), now);
                        }
                        if opened.is_ok() {
                            opened = channel.send_open(message.request_id, &message.body);
                        }
                        if let Err(code) = opened {
                            logging::warn!(log, "could not open the channel";
                                           "connection" => id, "status" => %code);
                            let _ = cm.close_connection(el, id);
                            return;
                        }
                    }
                    MessageType::Msg => {
                        // echo the service body on the same request id
                        let mut stream = &message.body[..];
                        if let Ok(type_id) = NodeId::decode(&mut stream) {
                            let _ = channel.send_message(
                                message.request_id,
                                MessageType::Msg,
                                &type_id,
                                stream,
                            );
                        }
                    }
                    MessageType::Clo => {
                        let _ = cm.close_connection(el, id);
                    }
                    _ => {}
                }
            }
        }
        Err(code) => {
            logging::warn!(log, "channel failed"; "connection" => id, "status" => %code);
            for chunk in channel.take_output() {
                let _ = cm.send_with_connection(el, id, chunk);
            }
            let _ = cm.close_connection(el, id);
            return;
        }
    }

    for chunk in channel.take_output() {
        if cm.send_with_connection(el, id, chunk).is_err() {
            break;
        }
    }
}
