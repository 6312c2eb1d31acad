//! Command-line argument parsing.
//!
//! Exit codes: 0 success, 1 authentication, 2 configuration, 3 backend
//! unreachable, 4 query invalid, 5 timeout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// A natural-language data-access gateway.
#[derive(Parser, Debug)]
#[command(name = "datagate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path (overrides the search chain)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP gateway and background workers
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,

        /// Listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Ask one question against a backend and print the rows
    Query {
        /// The question, in English
        question: String,

        /// Backend to query (postgres, mongodb, qdrant, slack, shopify, ga4)
        #[arg(short = 'd', long)]
        db_type: Option<String>,

        /// Explicit connection URI
        #[arg(long)]
        uri: Option<String>,

        /// Narrate the result set with the LLM
        #[arg(long)]
        analyze: bool,

        /// Route through the multi-step tool execution node
        #[arg(long)]
        orchestrate: bool,
    },

    /// Probe backend connectivity
    TestConnection {
        /// Backend to probe
        #[arg(short = 'd', long)]
        db_type: Option<String>,

        /// Probe every configured backend
        #[arg(long)]
        all: bool,
    },

    /// Run a Slack indexing pass
    Index {
        /// Workspace id to index
        #[arg(long)]
        workspace: i64,

        /// Ignore watermarks and re-walk the retention window
        #[arg(long)]
        force_full: bool,
    },
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(args)
    }

    #[test]
    fn test_parse_serve() {
        let cli = parse(&["datagate", "serve", "--port", "9000"]);
        match cli.command {
            Command::Serve { port, .. } => assert_eq!(port, Some(9000)),
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_query() {
        let cli = parse(&[
            "datagate",
            "query",
            "how many orders do we have?",
            "--db-type",
            "postgres",
            "--analyze",
        ]);
        match cli.command {
            Command::Query {
                question,
                db_type,
                analyze,
                orchestrate,
                ..
            } => {
                assert_eq!(question, "how many orders do we have?");
                assert_eq!(db_type.as_deref(), Some("postgres"));
                assert!(analyze);
                assert!(!orchestrate);
            }
            _ => panic!("expected query"),
        }
    }

    #[test]
    fn test_parse_test_connection_all() {
        let cli = parse(&["datagate", "test-connection", "--all"]);
        match cli.command {
            Command::TestConnection { all, .. } => assert!(all),
            _ => panic!("expected test-connection"),
        }
    }

    #[test]
    fn test_parse_index() {
        let cli = parse(&["datagate", "index", "--workspace", "3", "--force-full"]);
        match cli.command {
            Command::Index {
                workspace,
                force_full,
            } => {
                assert_eq!(workspace, 3);
                assert!(force_full);
            }
            _ => panic!("expected index"),
        }
    }
}
