//! Free-text address -> Global / Country / Region / City location rows.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use dirscout_core::{Location, LocationLevel, NewLocation, GLOBAL_LOCATION_NAME, MAX_HIERARCHY_DEPTH};
use dirscout_storage::{ListingStore, LocationQuery, StoreError};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

const UNITED_STATES: &str = "United States";

const COUNTRY_ALIASES: &[(&str, &str)] = &[
    ("usa", UNITED_STATES),
    ("us", UNITED_STATES),
    ("u.s.", UNITED_STATES),
    ("u.s.a.", UNITED_STATES),
    ("united states of america", UNITED_STATES),
    ("uk", "United Kingdom"),
    ("gb", "United Kingdom"),
    ("great britain", "United Kingdom"),
    ("england", "United Kingdom"),
    ("uae", "United Arab Emirates"),
    ("u.a.e.", "United Arab Emirates"),
    ("south korea", "Republic of Korea"),
    ("korea", "Republic of Korea"),
    ("prc", "China"),
    ("people's republic of china", "China"),
];

/// Cities that identify their country on their own.
const CITY_COUNTRIES: &[(&str, &str)] = &[
    ("dubai", "United Arab Emirates"),
    ("abu dhabi", "United Arab Emirates"),
    ("sharjah", "United Arab Emirates"),
];

/// Places that are both city and country.
const CITY_STATES: &[(&str, &str)] = &[
    ("singapore", "Singapore"),
    ("monaco", "Monaco"),
    ("vatican city", "Vatican City"),
    ("hong kong", "Hong Kong"),
    ("macau", "Macau"),
];

const COUNTRIES: &[&str] = &[
    "Argentina", "Australia", "Austria", "Bahrain", "Bangladesh", "Belgium", "Brazil",
    "Bulgaria", "Canada", "Chile", "China", "Colombia", "Costa Rica", "Croatia", "Cyprus",
    "Czech Republic", "Denmark", "Egypt", "Estonia", "Finland", "France", "Germany", "Greece",
    "Hungary", "Iceland", "India", "Indonesia", "Ireland", "Israel", "Italy", "Japan", "Jordan",
    "Kenya", "Kuwait", "Latvia", "Lithuania", "Luxembourg", "Malaysia", "Malta", "Mexico",
    "Morocco", "Netherlands", "New Zealand", "Nigeria", "Norway", "Oman", "Pakistan", "Peru",
    "Philippines", "Poland", "Portugal", "Qatar", "Republic of Korea", "Romania", "Saudi Arabia",
    "Serbia", "Slovakia", "Slovenia", "South Africa", "Spain", "Sri Lanka", "Sweden",
    "Switzerland", "Taiwan", "Thailand", "Turkey", "Ukraine", "United Arab Emirates",
    "United Kingdom", "United States", "Uruguay", "Vietnam",
];

const US_STATES: &[(&str, &str)] = &[
    ("AL", "Alabama"), ("AK", "Alaska"), ("AZ", "Arizona"), ("AR", "Arkansas"),
    ("CA", "California"), ("CO", "Colorado"), ("CT", "Connecticut"), ("DE", "Delaware"),
    ("DC", "District of Columbia"), ("FL", "Florida"), ("GA", "Georgia"), ("HI", "Hawaii"),
    ("ID", "Idaho"), ("IL", "Illinois"), ("IN", "Indiana"), ("IA", "Iowa"), ("KS", "Kansas"),
    ("KY", "Kentucky"), ("LA", "Louisiana"), ("ME", "Maine"), ("MD", "Maryland"),
    ("MA", "Massachusetts"), ("MI", "Michigan"), ("MN", "Minnesota"), ("MS", "Mississippi"),
    ("MO", "Missouri"), ("MT", "Montana"), ("NE", "Nebraska"), ("NV", "Nevada"),
    ("NH", "New Hampshire"), ("NJ", "New Jersey"), ("NM", "New Mexico"), ("NY", "New York"),
    ("NC", "North Carolina"), ("ND", "North Dakota"), ("OH", "Ohio"), ("OK", "Oklahoma"),
    ("OR", "Oregon"), ("PA", "Pennsylvania"), ("RI", "Rhode Island"), ("SC", "South Carolina"),
    ("SD", "South Dakota"), ("TN", "Tennessee"), ("TX", "Texas"), ("UT", "Utah"),
    ("VT", "Vermont"), ("VA", "Virginia"), ("WA", "Washington"), ("WV", "West Virginia"),
    ("WI", "Wisconsin"), ("WY", "Wyoming"), ("PR", "Puerto Rico"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressComponents {
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
}

impl AddressComponents {
    fn is_empty(&self) -> bool {
        self.city.is_none() && self.state.is_none() && self.country.is_none()
    }
}

fn lookup<'a>(table: &'a [(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    let key = key.trim().to_lowercase();
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

fn city_state(name: &str) -> Option<&'static str> {
    lookup(CITY_STATES, name)
}

/// Canonical country name for an alias, city-state or listed country.
fn known_country(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    lookup(COUNTRY_ALIASES, trimmed)
        .or_else(|| city_state(trimmed))
        .or_else(|| COUNTRIES.iter().copied().find(|c| c.eq_ignore_ascii_case(trimmed)))
        .map(str::to_string)
}

fn us_state(token: &str) -> Option<String> {
    let token = token.trim();
    US_STATES
        .iter()
        .find(|(code, name)| code.eq_ignore_ascii_case(token) || name.eq_ignore_ascii_case(token))
        .map(|(code, name)| {
            // Codes stay codes ("TX"); full names stay full names ("Texas").
            if code.eq_ignore_ascii_case(token) {
                (*code).to_string()
            } else {
                (*name).to_string()
            }
        })
}

/// Alias-normalized country, otherwise the input title-cased.
pub fn normalize_country(country: &str) -> String {
    let trimmed = country.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Some(known) = known_country(trimmed) {
        return known;
    }
    trimmed
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

fn has_digit(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

/// Split off digit-bearing postal tokens: "TX 77001" -> ("TX", Some("77001")).
fn strip_postal(part: &str) -> (String, Option<String>) {
    let tokens: Vec<&str> = part.split_whitespace().collect();
    let start = tokens.iter().take_while(|t| has_digit(t)).count();
    let end = tokens.len() - tokens[start..].iter().rev().take_while(|t| has_digit(t)).count();
    let postal: Vec<&str> = tokens[..start]
        .iter()
        .chain(tokens[end.max(start)..].iter())
        .copied()
        .collect();
    let text = tokens[start..end.max(start)].join(" ");
    let postal = (!postal.is_empty()).then(|| postal.join(" "));
    (text, postal)
}

/// "10 Orchard Road" rather than "75001 Paris".
fn looks_like_street(part: &str) -> bool {
    let mut tokens = part.split_whitespace();
    let leads_with_number = tokens
        .next()
        .map(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    leads_with_number && tokens.count() >= 2
}

/// Pop trailing parts that hold nothing but a postal code ("77002", "SW1A 1AA").
fn pop_postcodes(parts: &mut Vec<&str>, out: &mut AddressComponents) {
    while let Some(last) = parts.last().copied() {
        match strip_postal(last) {
            (text, Some(code)) if text.is_empty() => {
                out.postcode.get_or_insert(code);
                parts.pop();
            }
            _ => break,
        }
    }
}

/// "WA", "NSW", "ON".
fn is_region_code(part: &str) -> bool {
    (2..=3).contains(&part.len()) && part.chars().all(|c| c.is_ascii_uppercase())
}

/// Whether `candidate`, the part before a non-US country, names a region
/// rather than the city. `remaining` counts the parts left including it.
fn looks_like_region(candidate: &str, city: &str, remaining: usize) -> bool {
    !has_digit(candidate)
        && lookup(CITY_COUNTRIES, candidate).is_none()
        && city_state(candidate).is_none()
        && (remaining == 2 || is_region_code(candidate))
        && !has_digit(city)
        && !looks_like_street(city)
}

fn us_address_pattern() -> &'static Regex {
    static US: OnceLock<Regex> = OnceLock::new();
    US.get_or_init(|| {
        Regex::new(r"(.+?),\s*([^,]+),\s*([A-Z]{2}),?\s+(\d{5}(?:-\d{4})?)").expect("us address regex")
    })
}

/// Best-effort split of a free-text address into components.
///
/// `street, city, ST[,] 12345[, country]` is recognized directly; anything
/// else is read right to left from its comma-separated parts (postal codes,
/// country, a region, then the city).
pub fn parse_address(raw: &str) -> AddressComponents {
    let raw = raw.trim();
    if raw.is_empty() {
        return AddressComponents::default();
    }

    if let Some(caps) = us_address_pattern().captures(raw) {
        let trailing = raw[caps.get(0).map_or(raw.len(), |m| m.end())..]
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .last()
            .map(normalize_country);
        return AddressComponents {
            street: Some(caps[1].trim().to_string()),
            city: Some(caps[2].trim().to_string()),
            state: Some(caps[3].to_string()),
            postcode: Some(caps[4].to_string()),
            country: Some(trailing.unwrap_or_else(|| UNITED_STATES.to_string())),
        };
    }

    let mut parts: Vec<&str> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    let mut out = AddressComponents::default();
    pop_postcodes(&mut parts, &mut out);

    // Country: a recognizable last part, or any last part of a 3+ part address.
    if let Some(last) = parts.last().copied() {
        let (text, postal) = strip_postal(last);
        if lookup(CITY_COUNTRIES, &text).is_none() && us_state(&text).is_none() {
            if let Some(country) = known_country(&text) {
                out.country = Some(country);
                out.postcode = postal;
                parts.pop();
            } else if parts.len() >= 3 && !text.is_empty() {
                out.country = Some(normalize_country(&text));
                out.postcode = postal;
                parts.pop();
            }
        }
    }

    pop_postcodes(&mut parts, &mut out);

    // State: a US state for US or unknown countries, otherwise "city, region".
    if matches!(out.country.as_deref(), None | Some(UNITED_STATES)) {
        if let Some(last) = parts.last().copied() {
            let (text, postal) = strip_postal(last);
            if let Some(state) = us_state(&text).filter(|_| parts.len() >= 2 || out.country.is_none()) {
                out.state = Some(state);
                out.postcode = out.postcode.or(postal);
                out.country = Some(UNITED_STATES.to_string());
                parts.pop();
            }
        }
    } else if let [.., city, candidate] = parts.as_slice() {
        if looks_like_region(candidate, city, parts.len()) {
            out.state = Some((*candidate).to_string());
            parts.pop();
        }
    }

    if let Some(last) = parts.last().copied() {
        if !looks_like_street(last) {
            let (text, postal) = strip_postal(last);
            if !text.is_empty() {
                out.city = Some(text);
                out.postcode = out.postcode.or(postal);
                parts.pop();
            }
        }
    }
    if !parts.is_empty() {
        out.street = Some(parts.join(", "));
    }

    out
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub created_locations: u64,
    pub parse_errors: u64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    name: String,
    level: LocationLevel,
    /// Set for cities only, so same-named cities in different countries stay apart.
    parent: Option<Uuid>,
}

impl CacheKey {
    fn new(name: &str, level: LocationLevel, parent: Option<Uuid>) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            level,
            parent: if level == LocationLevel::City { parent } else { None },
        }
    }
}

/// Resolves addresses to location ids, creating missing hierarchy rows.
///
/// Hits are served from an in-memory cache keyed by `(lowercased name,
/// level)` plus the parent id for cities. In read-only mode misses that would
/// create a row resolve to `None` instead.
pub struct LocationResolver {
    store: Arc<dyn ListingStore>,
    cache: HashMap<CacheKey, Location>,
    by_id: HashMap<Uuid, Location>,
    read_only: bool,
    cache_hits: u64,
    cache_misses: u64,
    created_locations: u64,
    parse_errors: u64,
}

impl LocationResolver {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
            by_id: HashMap::new(),
            read_only: false,
            cache_hits: 0,
            cache_misses: 0,
            created_locations: 0,
            parse_errors: 0,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Load every persisted location into the cache in one query.
    pub async fn warm(&mut self) -> Result<usize, StoreError> {
        let rows = self.store.all_locations().await?;
        let count = rows.len();
        for row in rows {
            self.remember(row);
        }
        info!(locations = count, "location cache warmed");
        Ok(count)
    }

    fn remember(&mut self, location: Location) {
        let key = CacheKey::new(&location.name, location.level, location.parent_id);
        self.by_id.insert(location.id, location.clone());
        self.cache.entry(key).or_insert(location);
    }

    pub fn stats(&self) -> ResolverStats {
        let lookups = self.cache_hits + self.cache_misses;
        ResolverStats {
            cache_hits: self.cache_hits,
            cache_misses: self.cache_misses,
            created_locations: self.created_locations,
            parse_errors: self.parse_errors,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                self.cache_hits as f64 / lookups as f64
            },
        }
    }

    /// Deepest location for `address`: the city when one is found, else the country.
    ///
    /// `None` when no country can be determined even with `fallback_country`.
    pub async fn resolve(
        &mut self,
        address: &str,
        latitude: Option<f64>,
        longitude: Option<f64>,
        fallback_country: Option<&str>,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut parts = parse_address(address);
        if !address.trim().is_empty() && parts.is_empty() {
            self.parse_errors += 1;
        }

        // A country that landed in the state slot ("..., UK 12345").
        if let Some(country) = parts.state.as_deref().and_then(known_country) {
            parts.country = Some(country);
            parts.state = None;
        }
        if let Some(city) = parts.city.as_deref() {
            if let Some(country) = city_state(city).or_else(|| lookup(CITY_COUNTRIES, city)) {
                parts.country = Some(country.to_string());
            }
        }
        if parts.country.is_none() {
            parts.country = fallback_country
                .map(normalize_country)
                .filter(|c| !c.is_empty());
        }
        let Some(country) = parts.country.clone() else {
            debug!(address, "no country for address");
            return Ok(None);
        };
        if parts.city.is_none() && city_state(&country).is_some() {
            parts.city = Some(country.clone());
        }

        let Some(global) = self.get_or_create(GLOBAL_LOCATION_NAME, LocationLevel::Global, None, None).await? else {
            return Ok(None);
        };
        let Some(country_row) = self
            .get_or_create(&country, LocationLevel::Country, Some(global.id), None)
            .await?
        else {
            return Ok(None);
        };

        let mut parent = country_row.id;
        if let Some(state) = parts.state.as_deref() {
            match self
                .get_or_create(state, LocationLevel::Region, Some(parent), None)
                .await?
            {
                Some(region) => parent = region.id,
                None => return Ok(Some(country_row.id)),
            }
        }

        let Some(city) = parts.city.as_deref() else {
            return Ok(Some(country_row.id));
        };
        let coords = latitude.zip(longitude);
        match self
            .get_or_create(city, LocationLevel::City, Some(parent), coords)
            .await?
        {
            Some(city) => Ok(Some(city.id)),
            None => Ok(Some(country_row.id)),
        }
    }

    async fn get_or_create(
        &mut self,
        name: &str,
        level: LocationLevel,
        parent_id: Option<Uuid>,
        coords: Option<(f64, f64)>,
    ) -> Result<Option<Location>, StoreError> {
        let key = CacheKey::new(name, level, parent_id);
        if let Some(hit) = self.cache.get(&key) {
            self.cache_hits += 1;
            return Ok(Some(hit.clone()));
        }
        self.cache_misses += 1;

        let query = LocationQuery {
            name: name.trim().to_string(),
            level,
            parent_id: key.parent,
        };
        let existing = self.store.find_location(&query).await?;
        let row = match existing {
            Some(row) => row,
            None if self.read_only => return Ok(None),
            None => {
                let mut new = NewLocation::new(name.trim(), level, parent_id);
                if let Some((lat, lon)) = coords {
                    new = new.with_coordinates(Some(lat), Some(lon));
                }
                let row = self.store.insert_location(&new).await?;
                self.created_locations += 1;
                info!(name = %row.name, level = row.level.as_str(), id = %row.id, "created location");
                row
            }
        };
        self.remember(row.clone());
        Ok(Some(row))
    }

    async fn lookup_id(&mut self, id: Uuid) -> Result<Option<Location>, StoreError> {
        if let Some(row) = self.by_id.get(&id) {
            return Ok(Some(row.clone()));
        }
        let row = self.store.location(id).await?;
        if let Some(row) = &row {
            self.by_id.insert(row.id, row.clone());
        }
        Ok(row)
    }

    /// Whether `id` reaches the global root within the maximum hierarchy depth.
    pub async fn validate_hierarchy(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let mut current = id;
        for _ in 0..=MAX_HIERARCHY_DEPTH {
            let Some(row) = self.lookup_id(current).await? else {
                warn!(%id, missing = %current, "location chain references a missing row");
                return Ok(false);
            };
            if row.level == LocationLevel::Global {
                return Ok(true);
            }
            match row.parent_id {
                Some(parent) => current = parent,
                None => {
                    warn!(%id, orphan = %row.id, "location chain ends before the global root");
                    return Ok(false);
                }
            }
        }
        warn!(%id, max_depth = MAX_HIERARCHY_DEPTH, "location chain exceeds maximum depth");
        Ok(false)
    }

    /// Names from `id` up to the root, for diagnostics.
    pub async fn ancestry(&mut self, id: Uuid) -> Result<Vec<Location>, StoreError> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(cur) = current {
            if chain.len() > MAX_HIERARCHY_DEPTH {
                break;
            }
            let Some(row) = self.lookup_id(cur).await? else {
                break;
            };
            current = row.parent_id;
            chain.push(row);
        }
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirscout_storage::MemoryStore;

    fn resolver() -> (MemoryStore, LocationResolver) {
        let store = MemoryStore::new();
        let resolver = LocationResolver::new(Arc::new(store.clone()));
        (store, resolver)
    }

    fn names(chain: &[Location]) -> Vec<(&str, LocationLevel)> {
        chain.iter().map(|l| (l.name.as_str(), l.level)).collect()
    }

    #[test]
    fn us_pattern_extracts_city_state_and_country() {
        let parts = parse_address("123 Main St, Houston, TX 77001, United States");
        assert_eq!(parts.city.as_deref(), Some("Houston"));
        assert_eq!(parts.state.as_deref(), Some("TX"));
        assert_eq!(parts.postcode.as_deref(), Some("77001"));
        assert_eq!(parts.country.as_deref(), Some("United States"));
        assert_eq!(parts.street.as_deref(), Some("123 Main St"));
    }

    #[test]
    fn comma_fallback_reads_right_to_left() {
        let houston = parse_address("Houston, TX");
        assert_eq!(houston.city.as_deref(), Some("Houston"));
        assert_eq!(houston.state.as_deref(), Some("TX"));
        assert_eq!(houston.country.as_deref(), Some("United States"));

        let dubai = parse_address("Office 4, Business Bay, Dubai, UAE");
        assert_eq!(dubai.city.as_deref(), Some("Dubai"));
        assert_eq!(dubai.country.as_deref(), Some("United Arab Emirates"));

        let berlin = parse_address("Hauptstrasse 5, 10115 Berlin, Germany");
        assert_eq!(berlin.city.as_deref(), Some("Berlin"));
        assert_eq!(berlin.postcode.as_deref(), Some("10115"));
        assert_eq!(berlin.country.as_deref(), Some("Germany"));

        let street_only = parse_address("10 Orchard Road, Singapore 238841");
        assert_eq!(street_only.city, None);
        assert_eq!(street_only.country.as_deref(), Some("Singapore"));
    }

    #[test]
    fn zip_as_its_own_part_is_a_postcode() {
        let joined = parse_address("9 Elm St, Houston, TX, 77002");
        assert_eq!(joined.street.as_deref(), Some("9 Elm St"));
        assert_eq!(joined.city.as_deref(), Some("Houston"));
        assert_eq!(joined.state.as_deref(), Some("TX"));
        assert_eq!(joined.postcode.as_deref(), Some("77002"));
        assert_eq!(joined.country.as_deref(), Some("United States"));

        let lower = parse_address("9 Elm St, Houston, tx, 77002-1234");
        assert_eq!(lower.city.as_deref(), Some("Houston"));
        assert_eq!(lower.state.as_deref(), Some("TX"));
        assert_eq!(lower.postcode.as_deref(), Some("77002-1234"));

        let london = parse_address("221 Baker Street, London, SW1A 1AA, United Kingdom");
        assert_eq!(london.city.as_deref(), Some("London"));
        assert_eq!(london.postcode.as_deref(), Some("SW1A 1AA"));
        assert_eq!(london.country.as_deref(), Some("United Kingdom"));
    }

    #[test]
    fn regions_outside_the_us_are_not_cities() {
        let perth = parse_address("Perth, WA, Australia");
        assert_eq!(perth.city.as_deref(), Some("Perth"));
        assert_eq!(perth.state.as_deref(), Some("WA"));
        assert_eq!(perth.street, None);
        assert_eq!(perth.country.as_deref(), Some("Australia"));

        let toronto = parse_address("100 King St W, Toronto, ON, Canada");
        assert_eq!(toronto.street.as_deref(), Some("100 King St W"));
        assert_eq!(toronto.city.as_deref(), Some("Toronto"));
        assert_eq!(toronto.state.as_deref(), Some("ON"));

        let named = parse_address("Perth, Western Australia, Australia");
        assert_eq!(named.city.as_deref(), Some("Perth"));
        assert_eq!(named.state.as_deref(), Some("Western Australia"));

        let zurich = parse_address("Bahnhofstrasse 1, 8001 Zurich, Switzerland");
        assert_eq!(zurich.city.as_deref(), Some("Zurich"));
        assert_eq!(zurich.state, None);
    }

    #[test]
    fn aliases_and_title_case() {
        assert_eq!(normalize_country("USA"), "United States");
        assert_eq!(normalize_country(" uk "), "United Kingdom");
        assert_eq!(normalize_country("korea"), "Republic of Korea");
        assert_eq!(normalize_country("new caledonia"), "New Caledonia");
    }

    #[tokio::test]
    async fn houston_resolves_to_full_chain_then_hits_cache() {
        let (store, mut resolver) = resolver();
        let address = "123 Main St, Houston, TX 77001, United States";

        let first = resolver
            .resolve(address, Some(29.7604), Some(-95.3698), None)
            .await
            .unwrap()
            .expect("resolved");
        assert_eq!(store.location_count().await, 4);

        let chain = resolver.ancestry(first).await.unwrap();
        assert_eq!(
            names(&chain),
            vec![
                ("Houston", LocationLevel::City),
                ("TX", LocationLevel::Region),
                ("United States", LocationLevel::Country),
                ("Global", LocationLevel::Global),
            ]
        );
        assert_eq!(chain[0].latitude, Some(29.7604));
        assert!(resolver.validate_hierarchy(first).await.unwrap());

        let before = resolver.stats();
        let second = resolver.resolve(address, None, None, None).await.unwrap();
        assert_eq!(second, Some(first));
        assert_eq!(store.location_count().await, 4);
        let after = resolver.stats();
        assert_eq!(after.created_locations, before.created_locations);
        assert_eq!(after.cache_hits, before.cache_hits + 4);
        assert_eq!(after.cache_misses, before.cache_misses);
    }

    #[tokio::test]
    async fn joined_address_parts_resolve_to_city() {
        let (_, mut resolver) = resolver();
        let id = resolver
            .resolve("9 Elm St, Houston, TX, 77002", None, None, Some("United States"))
            .await
            .unwrap()
            .expect("resolved");
        let chain = resolver.ancestry(id).await.unwrap();
        assert_eq!(
            names(&chain),
            vec![
                ("Houston", LocationLevel::City),
                ("TX", LocationLevel::Region),
                ("United States", LocationLevel::Country),
                ("Global", LocationLevel::Global),
            ]
        );

        let perth = resolver
            .resolve("Perth, WA, Australia", None, None, None)
            .await
            .unwrap()
            .expect("resolved");
        let chain = resolver.ancestry(perth).await.unwrap();
        assert_eq!(
            names(&chain)[..3].to_vec(),
            vec![
                ("Perth", LocationLevel::City),
                ("WA", LocationLevel::Region),
                ("Australia", LocationLevel::Country),
            ]
        );
    }

    #[tokio::test]
    async fn city_states_nest_under_themselves() {
        let (_, mut resolver) = resolver();
        let id = resolver
            .resolve("10 Orchard Road, Singapore 238841", None, None, None)
            .await
            .unwrap()
            .expect("resolved");
        let chain = resolver.ancestry(id).await.unwrap();
        assert_eq!(
            names(&chain),
            vec![
                ("Singapore", LocationLevel::City),
                ("Singapore", LocationLevel::Country),
                ("Global", LocationLevel::Global),
            ]
        );
    }

    #[tokio::test]
    async fn fallback_country_and_unresolvable_addresses() {
        let (_, mut resolver) = resolver();
        assert_eq!(resolver.resolve("", None, None, None).await.unwrap(), None);

        let id = resolver
            .resolve("", None, None, Some("usa"))
            .await
            .unwrap()
            .expect("country level");
        let chain = resolver.ancestry(id).await.unwrap();
        assert_eq!(names(&chain)[0], ("United States", LocationLevel::Country));

        let lyon = resolver
            .resolve("12 Rue Victor Hugo, Lyon", None, None, Some("France"))
            .await
            .unwrap()
            .expect("city");
        let chain = resolver.ancestry(lyon).await.unwrap();
        assert_eq!(names(&chain)[0], ("Lyon", LocationLevel::City));
        assert_eq!(names(&chain)[1], ("France", LocationLevel::Country));
    }

    #[tokio::test]
    async fn same_city_name_in_two_countries_stays_distinct() {
        let (_, mut resolver) = resolver();
        let uk = resolver.resolve("London, United Kingdom", None, None, None).await.unwrap();
        let ca = resolver.resolve("London, Canada", None, None, None).await.unwrap();
        assert!(uk.is_some() && ca.is_some());
        assert_ne!(uk, ca);
    }

    #[tokio::test]
    async fn warm_cache_serves_existing_rows() {
        let store = MemoryStore::new();
        {
            let mut seed = LocationResolver::new(Arc::new(store.clone()));
            seed.resolve("Austin, TX", None, None, None).await.unwrap();
        }

        let mut resolver = LocationResolver::new(Arc::new(store.clone()));
        assert_eq!(resolver.warm().await.unwrap(), 4);
        resolver.resolve("Austin, TX", None, None, None).await.unwrap();
        let stats = resolver.stats();
        assert_eq!(stats.cache_misses, 0);
        assert_eq!(stats.created_locations, 0);
        assert_eq!(stats.cache_hit_rate, 1.0);
    }

    #[tokio::test]
    async fn read_only_resolver_never_creates_rows() {
        let (store, resolver) = resolver();
        let mut resolver = resolver.read_only(true);
        let id = resolver.resolve("Houston, TX", None, None, None).await.unwrap();
        assert_eq!(id, None);
        assert_eq!(store.location_count().await, 0);
    }

    #[tokio::test]
    async fn broken_chains_fail_validation() {
        let store = MemoryStore::new();
        let orphan = store
            .insert_location(&NewLocation::new("Nowhere", LocationLevel::City, Some(Uuid::new_v4())))
            .await
            .unwrap();
        let mut resolver = LocationResolver::new(Arc::new(store.clone()));
        assert!(!resolver.validate_hierarchy(orphan.id).await.unwrap());

        // A parent cycle never reaches the root.
        let a = store
            .insert_location(&NewLocation::new("Loop", LocationLevel::Region, None))
            .await
            .unwrap();
        let mut looped = resolver.lookup_id(a.id).await.unwrap().unwrap();
        looped.parent_id = Some(a.id);
        resolver.by_id.insert(a.id, looped);
        assert!(!resolver.validate_hierarchy(a.id).await.unwrap());
    }
}
