//! Interactive terminal client
//!
//! Reads stdin line by line. Plain lines are sent as text, `/img <path>`
//! sends an image, `/to <peer>` changes the target, `/quit` exits.

use std::path::PathBuf;

use jetlink_net::{
    prepare_outgoing_file, ContentType, Delivery, Error, ForegroundPolicy, Inbox, Link, LinkConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::downloads::DownloadSink;

pub struct ChatOptions {
    pub link: LinkConfig,
    pub user_id: String,
    pub peer: Option<String>,
    pub download_dir: PathBuf,
    pub bell: bool,
}

/// Rings the terminal bell for incoming messages when enabled
struct Bell(bool);

impl ForegroundPolicy for Bell {
    fn should_notify(&self, _sender_id: &str) -> bool {
        self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Text(&'a str),
    Image(&'a str),
    Target(Option<&'a str>),
    Quit,
    Empty,
}

fn parse_input(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if line == "/quit" {
        return Input::Quit;
    }
    if let Some(path) = line.strip_prefix("/img ") {
        return Input::Image(path.trim());
    }
    if line == "/to" {
        return Input::Target(None);
    }
    if let Some(peer) = line.strip_prefix("/to ") {
        let peer = peer.trim();
        return Input::Target((!peer.is_empty()).then_some(peer));
    }
    Input::Text(line)
}

fn print_delivery(delivery: Delivery) {
    let bell = if delivery.notify { "\x07" } else { "" };
    println!("{bell}[{}] {}", delivery.sender_id, delivery.preview);
}

pub async fn run(options: ChatOptions) -> Result<(), Error> {
    let link = Link::connect(options.link, options.user_id.clone())?;
    let sink = DownloadSink::new(options.download_dir.clone())?;
    let inbox = Inbox::new(options.user_id.clone(), sink, Bell(options.bell));

    println!(
        "You are {}. Images are saved to {}.",
        options.user_id,
        options.download_dir.display()
    );

    let messages = link.subscribe_messages();
    let typing = link.subscribe_typing();

    tokio::select! {
        _ = inbox.run(messages, print_delivery) => {}
        _ = show_typing(&link, typing) => {}
        _ = read_stdin(&link, options.peer) => {}
    }

    link.disconnect().await;
    info!("Chat session ended");
    Ok(())
}

async fn show_typing(link: &Link, mut typing: broadcast::Receiver<jetlink_net::TypingSignal>) {
    loop {
        match typing.recv().await {
            Ok(signal) if signal.from != link.own_id() => {
                println!("  {} is typing...", signal.from);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn read_stdin(link: &Link, mut peer: Option<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read stdin");
                break;
            }
        };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Target(target) => {
                peer = target.map(str::to_string);
                println!("Sending to {}", peer.as_deref().unwrap_or("everyone"));
            }
            Input::Text(text) => {
                link.notify_typing(peer.as_deref());
                report(link.send(peer.as_deref(), ContentType::Text, text, None).await);
            }
            Input::Image(path) => match prepare_outgoing_file(path).await {
                Ok(encoded) => {
                    report(
                        link.send(peer.as_deref(), ContentType::Image, encoded, None)
                            .await,
                    );
                }
                Err(e) => println!("Image not sent: {e}"),
            },
        }
    }
}

fn report(result: Result<(), Error>) {
    match result {
        Ok(()) => {}
        Err(Error::NotConnected) => println!("Not connected, message not sent"),
        Err(e) => println!("Message not sent: {e}"),
    }
}
