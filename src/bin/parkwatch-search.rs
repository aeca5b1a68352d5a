use std::{error::Error, time::Duration};

use clap::Parser;
use parkwatch::{
    dispatch::{KakaoSearch, PlaceSearch, SearchOptions},
    Coordinate,
};

/// parkwatch-search command line arguments
#[derive(Parser, Debug)]
#[command(version)]
struct SearchArgs {
    /// Latitude of the search centre
    #[arg(long, allow_negative_numbers = true)]
    latitude: f64,

    /// Longitude of the search centre
    #[arg(long, allow_negative_numbers = true)]
    longitude: f64,

    /// The keyword search endpoint
    #[arg(
        long,
        default_value = "https://dapi.kakao.com/v2/local/search/keyword.json",
        env = "PARKWATCH_SEARCH_URL"
    )]
    search_url: String,

    /// REST API key of the keyword search
    #[arg(short = 'k', long, env = "PARKWATCH_SEARCH_KEY")]
    search_key: String,

    /// Keyword to search for
    #[arg(short = 'q', long, default_value = "술집", env = "PARKWATCH_SEARCH_QUERY")]
    search_query: String,

    /// Search radius in metres
    #[arg(short = 'r', long, default_value_t = 1000, env = "PARKWATCH_SEARCH_RADIUS")]
    search_radius: u32,

    /// Maximum places returned
    #[arg(long, default_value_t = 10, env = "PARKWATCH_SEARCH_SIZE")]
    search_size: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = SearchArgs::parse();

    let search = KakaoSearch::new(SearchOptions {
        url: cli.search_url,
        api_key: cli.search_key,
        query: cli.search_query,
        size: cli.search_size,
        timeout: Duration::from_secs(10),
    })?;

    let places = search
        .search(
            Coordinate {
                latitude: cli.latitude,
                longitude: cli.longitude,
            },
            cli.search_radius,
        )
        .await?;

    if places.is_empty() {
        println!("No places within {}m", cli.search_radius);
    }
    for place in &places {
        println!(
            "- {} | {} | {}m",
            place.place_name, place.address_name, place.distance
        );
    }
    println!("{} places found", places.len());
    Ok(())
}
