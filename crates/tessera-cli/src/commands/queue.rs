//! Queue commands - talk to a cluster running `--app queue`.

use anyhow::Result;

use crate::{QueueCommands, Target};

pub fn run(target: &Target, command: QueueCommands) -> Result<()> {
    let mut client = super::connect(target)?;
    super::runtime()?.block_on(async move {
        match command {
            QueueCommands::Push { value } => println!("{}", client.push(&value).await?),
            QueueCommands::Pop => match client.pop().await? {
                Some(message) => println!("{}\t{}", message.id, message.value),
                None => println!("(empty)"),
            },
            QueueCommands::Done { id } => {
                client.done(id).await?;
                println!("Done {id}");
            }
            QueueCommands::Len => println!("{}", client.len().await?),
            QueueCommands::InProgress => println!("{}", client.len_in_progress().await?),
        }
        Ok::<(), anyhow::Error>(())
    })
}
