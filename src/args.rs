use clap::Parser;

/// Live tallies and leaderboards for the democradeck candidate cards.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path) The JSON file describing the deck: the list of candidates and, optionally, the engine
    /// settings and a file of votes already cast.
    #[clap(short, long, value_parser)]
    pub config: String,

    /// (file path, optional) A JSON file with the votes already stored, one row per vote. Setting this option
    /// overrides the votes file that may be specified in the --config file.
    #[clap(long, value_parser)]
    pub votes: Option<String>,

    /// (candidate:category, repeatable) Casts a vote before printing the leaderboards, for example
    /// --cast anna:mayor. Every occurrence is a separate vote.
    #[clap(long, value_parser)]
    pub cast: Vec<String>,

    /// (mayor or councillor, optional) Only prints the leaderboard of this category.
    #[clap(long, value_parser)]
    pub category: Option<String>,

    /// (file path, 'stdout' or empty) Where to write the leaderboards in JSON format. Defaults to the standard
    /// output.
    #[clap(short, long, value_parser)]
    pub out: Option<String>,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}
