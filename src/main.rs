use std::{path::PathBuf, process::ExitCode, str::FromStr};

use chainstate::{chain, chain::Chain, error::Error, ledger::Block, storage};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use serde::Deserialize;
use tracing::{error, info};

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args = Cli::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e} (retryable: {})", e.is_retryable());
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<(), Error> {
    let config = Config::new(&args.config)?;

    let db_path = args.db.unwrap_or(config.db_path);

    info!("using db path: {}", db_path.display());

    let chain = Chain::open(&db_path, &config.storage, &config.chain)?;

    match args.command {
        Command::Init { owner } => {
            let genesis = chain.init(&owner.0)?;

            println!("genesis {}", hex::encode(genesis.hash));
        }
        Command::Mine { miner } => {
            let block = chain.mine(vec![], &miner.0)?;

            print_block(&block);
        }
        Command::Send {
            from,
            to,
            amount,
            miner,
        } => {
            let miner = miner.unwrap_or_else(|| from.clone());
            let block = chain.transfer(&from.0, &to.0, amount, &miner.0)?;

            println!("sent {amount} from {from} to {to}");
            print_block(&block);
        }
        Command::Balance { owner } => {
            println!("balance of {owner}: {}", chain.balance(&owner.0)?);
        }
        Command::Utxos { owner } => {
            for out in chain.utxo_set().find_utxo(&owner.0)? {
                println!("{}", out.value);
            }
        }
        Command::Spendable { owner, amount } => {
            let (total, selected) = chain.utxo_set().find_spendable_outputs(&owner.0, amount)?;

            for (tx_id, vouts) in &selected {
                println!("{} [{}]", hex::encode(tx_id), vouts.iter().join(", "));
            }

            if total < amount {
                println!("insufficient funds: {total} of {amount}");
            } else {
                println!("total {total}");
            }
        }
        Command::Reindex => {
            chain.reindex()?;
        }
        Command::Dump => {
            for (tx_id, outputs) in chain.utxo_set().entries()? {
                println!(
                    "{} -> {}",
                    hex::encode(tx_id),
                    outputs
                        .iter()
                        .map(|utxo| format!(
                            "{}:{}@{}",
                            utxo.vout,
                            utxo.output.value,
                            hex::encode(&utxo.output.pub_key_hash)
                        ))
                        .join(", ")
                );
            }
        }
        Command::Blocks { height } => match height {
            Some(height) => match chain.blocks().block_at(height)? {
                Some(block) => print_block(&block),
                None => println!("no block at height {height}"),
            },
            None => {
                for block in chain.blocks().blocks_newest_first()? {
                    print_block(&block);
                }
            }
        },
    }

    Ok(())
}

fn print_block(block: &Block) {
    println!(
        "block {} {} (prev {})",
        block.height,
        hex::encode(block.hash),
        hex::encode(block.prev_hash)
    );

    for tx in &block.transactions {
        println!(
            "  tx {} ({} in, {} out{})",
            hex::encode(tx.id),
            tx.inputs.len(),
            tx.outputs.len(),
            if tx.is_coinbase() { ", coinbase" } else { "" }
        );
    }
}

/// Hex encoded hash of an owner's public key.
#[derive(Debug, Clone)]
struct PubKeyHash(Vec<u8>);

impl FromStr for PubKeyHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        hex::decode(s).map(Self)
    }
}

impl std::fmt::Display for PubKeyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the genesis block, paying the subsidy to `owner`
    Init {
        #[arg(long)]
        owner: PubKeyHash,
    },
    /// Mine a block containing only a coinbase
    Mine {
        #[arg(long)]
        miner: PubKeyHash,
    },
    /// Transfer value and mine the transaction into a new block
    Send {
        #[arg(long)]
        from: PubKeyHash,
        #[arg(long)]
        to: PubKeyHash,
        #[arg(long)]
        amount: u64,
        /// Receiver of the block's coinbase (defaults to the sender)
        #[arg(long)]
        miner: Option<PubKeyHash>,
    },
    Balance {
        #[arg(long)]
        owner: PubKeyHash,
    },
    Utxos {
        #[arg(long)]
        owner: PubKeyHash,
    },
    /// Show which outputs would be selected to cover `amount`
    Spendable {
        #[arg(long)]
        owner: PubKeyHash,
        #[arg(long)]
        amount: u64,
    },
    /// Rebuild the utxo table from the blocks
    Reindex,
    /// Print every row of the utxo table
    Dump,
    Blocks {
        #[arg(long)]
        height: Option<u64>,
    },
}

#[derive(Debug, Parser)]
#[clap(name = "chainstate")]
#[clap(bin_name = "chainstate")]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default)]
    pub storage: storage::Config,
    #[serde(default)]
    pub chain: chain::Config,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./tmp/chainstate")
}

impl Config {
    pub fn new(config_path: &Option<PathBuf>) -> Result<Self, config::ConfigError> {
        let mut s = config::Config::builder();

        s = s.add_source(config::File::with_name("chainstate.toml").required(false));

        if let Some(explicit) = config_path.as_ref().and_then(|x| x.to_str()) {
            s = s.add_source(config::File::with_name(explicit).required(true));
        }

        // e.g. CHAINSTATE_DB_PATH, CHAINSTATE_STORAGE__ROCKSDB_MEMORY_BUDGET
        s = s.add_source(
            config::Environment::with_prefix("CHAINSTATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        s.build()?.try_deserialize()
    }
}
