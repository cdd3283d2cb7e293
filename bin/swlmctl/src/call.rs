//! ---
//! swm_section: "05-networking-external-interfaces"
//! swm_subsection: "binary"
//! swm_type: "source"
//! swm_scope: "code"
//! swm_description: "Bus calls issued to a running daemon."
//! swm_version: "v0.0.0-prealpha"
//! swm_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use swm_common::AppConfig;
use swm_core::InboundRequest;
use swm_msg::{request, ArgValue, Message, MessagePayload};
use tokio::runtime::Runtime;
use tracing::debug;

/// Calls forwarded to the daemon's bus listener.
#[derive(Debug, Subcommand)]
pub enum CallCommand {
    /// Announce that an update can be downloaded.
    UpdateAvailable {
        update_id: String,
        description: String,
        #[arg(long, default_value = "")]
        signature: String,
        /// Ask the user before downloading.
        #[arg(long)]
        confirm: bool,
        #[arg(long, value_name = "ADDR")]
        address: Option<SocketAddr>,
    },
    /// Answer a pending confirmation request.
    Confirm {
        update_id: String,
        /// Decline instead of approving.
        #[arg(long)]
        decline: bool,
        #[arg(long, value_name = "ADDR")]
        address: Option<SocketAddr>,
    },
    /// Hand a downloaded image to the daemon.
    DownloadComplete {
        image: PathBuf,
        #[arg(long, default_value = "")]
        signature: String,
        #[arg(long, value_name = "ADDR")]
        address: Option<SocketAddr>,
    },
    /// Report an executor result for a dispatched operation.
    OperationResult {
        transaction_id: i64,
        #[arg(long, default_value_t = 0)]
        code: i32,
        #[arg(long, default_value = "")]
        text: String,
        #[arg(long, value_name = "ADDR")]
        address: Option<SocketAddr>,
    },
    /// List installed packages and module firmware.
    InstalledPackages {
        #[arg(long)]
        no_packages: bool,
        #[arg(long)]
        no_firmware: bool,
        #[arg(long, value_name = "ADDR")]
        address: Option<SocketAddr>,
    },
}

impl CallCommand {
    fn into_parts(self) -> (InboundRequest, Option<SocketAddr>) {
        match self {
            CallCommand::UpdateAvailable {
                update_id,
                description,
                signature,
                confirm,
                address,
            } => (
                InboundRequest::UpdateAvailable {
                    update_id,
                    description,
                    signature,
                    request_confirmation: confirm,
                },
                address,
            ),
            CallCommand::Confirm {
                update_id,
                decline,
                address,
            } => (
                InboundRequest::UpdateConfirmation {
                    update_id,
                    approved: !decline,
                },
                address,
            ),
            CallCommand::DownloadComplete {
                image,
                signature,
                address,
            } => (
                InboundRequest::DownloadComplete {
                    image_path: image.display().to_string(),
                    signature,
                },
                address,
            ),
            CallCommand::OperationResult {
                transaction_id,
                code,
                text,
                address,
            } => (
                InboundRequest::OperationResult {
                    transaction_id,
                    result_code: code,
                    result_text: text,
                },
                address,
            ),
            CallCommand::InstalledPackages {
                no_packages,
                no_firmware,
                address,
            } => (
                InboundRequest::GetInstalledPackages {
                    include_packages: !no_packages,
                    include_module_firmware: !no_firmware,
                },
                address,
            ),
        }
    }
}

pub fn run(command: CallCommand, config: &AppConfig) -> Result<()> {
    let (inbound, address) = command.into_parts();
    let address = address.unwrap_or(config.bus.listen);
    let method = inbound.method();
    let message = Message::new(MessagePayload::Call(inbound.into_call()));
    debug!(address = %address, method, message_id = %message.id, "sending call");

    let runtime = Runtime::new()?;
    let answer = runtime
        .block_on(request(address, &message))
        .with_context(|| format!("no answer from daemon at {address}"))?;
    let MessagePayload::Reply(reply) = answer.payload else {
        bail!("daemon answered {method} with a {}", answer.kind());
    };
    if !reply.accepted {
        bail!("daemon rejected {method}");
    }
    match reply.value {
        Some(ArgValue::StrList(items)) => items.iter().for_each(|item| println!("{item}")),
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("{method}: accepted"),
    }
    Ok(())
}
