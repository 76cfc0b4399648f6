//! Command-line adapter: a blocking stdin loop bridged into the runtime.

use std::io::Write;

use anyhow::Result;

use crate::hub::ChatHub;

pub async fn run_cli(hub: ChatHub, user_id: i64) -> Result<()> {
    println!("--- Reverie command-line adapter ---");
    println!("Chatting as user {}. Enter 'exit' or 'quit' to stop.", user_id);

    loop {
        print!("\n{}> ", user_id);
        std::io::stdout().flush()?;

        // input() would block the event loop; read on a blocking thread so
        // scheduled jobs keep running behind the prompt.
        let line = tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            match std::io::stdin().read_line(&mut buf) {
                Ok(0) => None,
                Ok(_) => Some(buf),
                Err(_) => None,
            }
        })
        .await?;

        let Some(line) = line else { break };
        let line = line.trim();
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            break;
        }
        if line.is_empty() {
            continue;
        }

        let reply = hub.handle_message(user_id, line).await;
        println!("Bot> {}", reply);
    }

    println!("\nGoodbye!");
    Ok(())
}
