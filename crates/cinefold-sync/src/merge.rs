//! Identity keys, field reducers and the deduplicating record set.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cinefold_core::{
    record_id_for_key, CanonicalRecord, FieldSources, RecordDraft, SourceId, Trailer,
};

pub const MAX_TRAILERS: usize = 2;

/// Lower-cases, folds everything that is not alphanumeric to a space and
/// collapses whitespace. Non-ASCII letters and digits are kept.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn title_key(title: &str, year: Option<i32>) -> Option<String> {
    let normalized = normalize_title(title);
    if normalized.is_empty() {
        return None;
    }
    let year = year.map_or_else(|| "?".to_string(), |y| y.to_string());
    Some(format!("title:{normalized}|{year}"))
}

/// IMDb id, else normalized title and year, else the first native id.
pub fn identity_key(draft: &RecordDraft) -> String {
    if let Some(imdb) = draft.imdb_id() {
        return imdb.key();
    }
    if let Some(key) = title_key(&draft.title, draft.year) {
        return key;
    }
    match draft.external_ids.first() {
        Some(id) => id.key(),
        None => format!("raw:{}", draft.title.trim()),
    }
}

/// Keys a draft can be found under, external ids first, IMDb leading.
fn candidate_keys(draft: &RecordDraft) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(imdb) = draft.imdb_id() {
        keys.push(imdb.key());
    }
    for id in &draft.external_ids {
        if !id.is_imdb() {
            keys.push(id.key());
        }
    }
    if let Some(key) = title_key(&draft.title, draft.year) {
        keys.push(key);
    }
    keys
}

fn priority_of(source: Option<SourceId>) -> u8 {
    source.map_or(0, |s| s.priority())
}

/// Keeps `old` unless it is empty or `new` comes from a strictly higher priority source.
/// Returns whether the value was replaced.
pub fn reduce_scalar<T>(
    old: &mut Option<T>,
    old_source: &mut Option<SourceId>,
    new: Option<T>,
    new_source: SourceId,
) -> bool {
    let Some(new) = new else {
        return false;
    };
    let replace = old.is_none() || new_source.priority() > priority_of(*old_source);
    if replace {
        *old = Some(new);
        *old_source = Some(new_source);
    }
    replace
}

pub fn reduce_set<T: Ord + Clone>(old: &mut BTreeSet<T>, new: &BTreeSet<T>) {
    old.extend(new.iter().cloned());
}

/// Union by URL, official first, ties by first-seen order, at most [`MAX_TRAILERS`].
pub fn reduce_trailers(old: &mut Vec<Trailer>, new: &[Trailer]) {
    for trailer in new {
        match old.iter_mut().find(|t| t.url == trailer.url) {
            Some(seen) => seen.is_official |= trailer.is_official,
            None => old.push(trailer.clone()),
        }
    }
    old.sort_by_key(|t| !t.is_official);
    old.truncate(MAX_TRAILERS);
}

/// Records the source's own rating and re-derives the headline value from
/// the highest priority source that has one.
pub fn reduce_rating(
    rating: &mut Option<f64>,
    ratings: &mut BTreeMap<SourceId, f64>,
    new: Option<f64>,
    source: SourceId,
) {
    if let Some(value) = new {
        ratings.insert(source, value);
    }
    *rating = ratings
        .iter()
        .max_by_key(|(source, _)| source.priority())
        .map(|(_, value)| *value);
}

pub fn reduce_categories(old: &mut BTreeSet<String>, crawl_key: &str) {
    old.insert(crawl_key.to_string());
}

fn apply_draft(record: &mut CanonicalRecord, draft: &RecordDraft) {
    let source = draft.source;
    let sources = &mut record.field_sources;

    let mut title = Some(record.title.clone()).filter(|t| !t.trim().is_empty());
    if reduce_scalar(&mut title, &mut sources.title, Some(draft.title.clone()), source) {
        record.title = draft.title.clone();
    }
    reduce_scalar(&mut record.year, &mut sources.year, draft.year, source);
    reduce_scalar(&mut record.overview, &mut sources.overview, draft.overview.clone(), source);
    reduce_scalar(&mut record.poster, &mut sources.poster, draft.poster_url.clone(), source);
    reduce_rating(&mut record.rating, &mut record.ratings, draft.rating, source);
    reduce_scalar(&mut record.budget, &mut sources.budget, draft.budget, source);
    reduce_scalar(&mut record.revenue, &mut sources.revenue, draft.revenue, source);

    reduce_set(&mut record.genres, &draft.genres);
    reduce_set(&mut record.cast, &draft.cast);
    reduce_set(&mut record.directors, &draft.directors);
    reduce_set(&mut record.writers, &draft.writers);
    reduce_set(&mut record.providers, &draft.providers);
    reduce_trailers(&mut record.trailers, &draft.trailers);
    reduce_categories(&mut record.category, &draft.crawl_key.to_string());
    record.sources.insert(source);
}

fn record_from_draft(draft: &RecordDraft) -> CanonicalRecord {
    let identity_key = identity_key(draft);
    let mut record = CanonicalRecord {
        id: record_id_for_key(&identity_key),
        identity_key,
        title: String::new(),
        year: None,
        overview: None,
        poster: None,
        rating: None,
        ratings: BTreeMap::new(),
        budget: None,
        revenue: None,
        genres: BTreeSet::new(),
        cast: BTreeSet::new(),
        directors: BTreeSet::new(),
        writers: BTreeSet::new(),
        trailers: Vec::new(),
        providers: BTreeSet::new(),
        category: BTreeSet::new(),
        sources: BTreeSet::new(),
        field_sources: FieldSources::default(),
        match_keys: BTreeSet::new(),
    };
    apply_draft(&mut record, draft);
    record
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Merged { changed: bool },
}

/// Ordered canonical records plus an index from every match key to a position.
#[derive(Debug, Default)]
pub struct RecordSet {
    records: Vec<CanonicalRecord>,
    index: HashMap<String, usize>,
}

impl RecordSet {
    /// Rebuilds the index from persisted match keys. Earlier records win a
    /// key claimed twice.
    pub fn from_records(records: Vec<CanonicalRecord>) -> Self {
        let mut set = Self {
            records,
            index: HashMap::new(),
        };
        for position in 0..set.records.len() {
            let record = &mut set.records[position];
            if record.match_keys.is_empty() {
                record.match_keys.insert(record.identity_key.clone());
                if let Some(key) = title_key(&record.title, record.year) {
                    record.match_keys.insert(key);
                }
            }
            for key in &record.match_keys {
                set.index.entry(key.clone()).or_insert(position);
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<CanonicalRecord> {
        self.records
    }

    fn imdb_of(&self, position: usize) -> Option<&str> {
        self.records[position]
            .match_keys
            .iter()
            .find(|k| k.starts_with("imdb:"))
            .map(String::as_str)
    }

    fn find(&self, draft: &RecordDraft) -> Option<usize> {
        let draft_imdb = draft.imdb_id().map(|id| id.key());
        for id in &draft.external_ids {
            if let Some(position) = self.index.get(&id.key()) {
                return Some(*position);
            }
        }
        let key = title_key(&draft.title, draft.year)?;
        let position = *self.index.get(&key)?;
        // Same title and year but a different IMDb title is a different work.
        match (draft_imdb.as_deref(), self.imdb_of(position)) {
            (Some(ours), Some(theirs)) if ours != theirs => None,
            _ => Some(position),
        }
    }

    pub fn merge(&mut self, draft: &RecordDraft) -> MergeOutcome {
        let keys = candidate_keys(draft);
        match self.find(draft) {
            Some(position) => {
                let before = self.records[position].clone();
                apply_draft(&mut self.records[position], draft);
                let changed = self.records[position] != before;
                self.claim_keys(position, keys);
                MergeOutcome::Merged { changed }
            }
            None => {
                let position = self.records.len();
                let record = record_from_draft(draft);
                let identity = record.identity_key.clone();
                self.records.push(record);
                self.claim_keys(position, std::iter::once(identity).chain(keys).collect());
                MergeOutcome::Inserted
            }
        }
    }

    /// Keys already owned by another record stay with it.
    fn claim_keys(&mut self, position: usize, keys: Vec<String>) {
        for key in keys {
            let owner = *self.index.entry(key.clone()).or_insert(position);
            if owner == position {
                self.records[position].match_keys.insert(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cinefold_core::{CrawlKey, ExternalId, Provider, ProviderKind};

    fn draft(source: SourceId, category: &str, title: &str, year: Option<i32>) -> RecordDraft {
        let at = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap();
        let mut d = RecordDraft::new(CrawlKey::new(source, category), at, title);
        d.year = year;
        d
    }

    fn trailer(url: &str, official: bool) -> Trailer {
        Trailer {
            url: url.to_string(),
            source: SourceId::Tmdb,
            is_official: official,
        }
    }

    #[test]
    fn titles_normalize_case_and_whitespace() {
        assert_eq!(normalize_title("The Matrix"), normalize_title("the matrix "));
        assert_eq!(normalize_title("  Amélie:  Le Fabuleux "), "amélie le fabuleux");
        assert_eq!(title_key("The Matrix", Some(1999)).as_deref(), Some("title:the matrix|1999"));
        assert_eq!(title_key("Dune", None).as_deref(), Some("title:dune|?"));
        assert_eq!(title_key("!!!", None), None);
    }

    #[test]
    fn identity_prefers_imdb_then_title() {
        let mut d = draft(SourceId::Tvmaze, "shows", "Lost", Some(2004));
        d.external_ids.push(ExternalId::new("tvmaze", "123"));
        assert_eq!(identity_key(&d), "title:lost|2004");
        d.external_ids.push(ExternalId::imdb("tt0411008"));
        assert_eq!(identity_key(&d), "imdb:tt0411008");

        let mut symbols = draft(SourceId::Tmdb, "movie/popular", "???", None);
        symbols.external_ids.push(ExternalId::new("tmdb:movie", "77"));
        assert_eq!(identity_key(&symbols), "tmdb:movie:77");
    }

    #[test]
    fn scalar_keeps_old_unless_empty_or_outranked() {
        let mut value = Some("tvmaze text".to_string());
        let mut source = Some(SourceId::Tvmaze);
        assert!(!reduce_scalar(&mut value, &mut source, Some("wiki".into()), SourceId::Wikidata));
        assert!(!reduce_scalar(&mut value, &mut source, Some("tvmaze 2".into()), SourceId::Tvmaze));
        assert!(reduce_scalar(&mut value, &mut source, Some("tmdb".into()), SourceId::Tmdb));
        assert_eq!(value.as_deref(), Some("tmdb"));
        assert_eq!(source, Some(SourceId::Tmdb));

        let mut empty: Option<String> = None;
        let mut none_source = None;
        assert!(reduce_scalar(&mut empty, &mut none_source, Some("w".into()), SourceId::Wikidata));
        assert!(!reduce_scalar(&mut empty, &mut none_source, None, SourceId::Tmdb));
        assert_eq!(empty.as_deref(), Some("w"));
    }

    #[test]
    fn trailers_prefer_official_and_cap_at_two() {
        let mut trailers = vec![trailer("a", false), trailer("b", false)];
        reduce_trailers(&mut trailers, &[trailer("c", true), trailer("a", false)]);
        let urls: Vec<_> = trailers.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(urls, vec!["c", "a"]);

        let mut upgraded = vec![trailer("x", false)];
        reduce_trailers(&mut upgraded, &[trailer("y", false), trailer("x", true)]);
        assert_eq!(upgraded[0].url, "x");
        assert!(upgraded[0].is_official);
    }

    #[test]
    fn rating_follows_source_priority() {
        let mut rating = None;
        let mut ratings = BTreeMap::new();
        reduce_rating(&mut rating, &mut ratings, Some(7.0), SourceId::Tvmaze);
        assert_eq!(rating, Some(7.0));
        reduce_rating(&mut rating, &mut ratings, Some(8.2), SourceId::Tmdb);
        assert_eq!(rating, Some(8.2));
        reduce_rating(&mut rating, &mut ratings, Some(6.0), SourceId::Tvmaze);
        assert_eq!(rating, Some(8.2));
        assert_eq!(ratings.get(&SourceId::Tvmaze), Some(&6.0));
        reduce_rating(&mut rating, &mut ratings, None, SourceId::Tmdb);
        assert_eq!(rating, Some(8.2));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut d = draft(SourceId::Tmdb, "movie/popular", "The Matrix", Some(1999));
        d.external_ids.push(ExternalId::new("tmdb:movie", "603"));
        d.genres.insert("Action".into());
        d.trailers.push(trailer("https://www.youtube.com/watch?v=1", true));

        let mut set = RecordSet::default();
        assert_eq!(set.merge(&d), MergeOutcome::Inserted);
        let once = set.records().to_vec();
        assert_eq!(set.merge(&d), MergeOutcome::Merged { changed: false });
        assert_eq!(set.records(), once.as_slice());
    }

    #[test]
    fn same_title_and_year_from_two_sources_unions_sets() {
        let mut tmdb = draft(SourceId::Tmdb, "tv/popular", "Under the Dome", Some(2013));
        tmdb.external_ids.push(ExternalId::new("tmdb:tv", "46331"));
        tmdb.genres.insert("Drama".into());
        tmdb.cast.insert("Mike Vogel".into());
        tmdb.providers.insert(Provider {
            provider_name: "Paramount Plus".into(),
            region: "US".into(),
            kind: ProviderKind::Flatrate,
        });

        let mut maze = draft(SourceId::Tvmaze, "shows", "under the dome ", Some(2013));
        maze.external_ids.push(ExternalId::new("tvmaze", "1"));
        maze.genres.insert("Thriller".into());
        maze.overview = Some("A small town is sealed off.".into());

        let mut set = RecordSet::default();
        set.merge(&tmdb);
        assert_eq!(set.merge(&maze), MergeOutcome::Merged { changed: true });

        assert_eq!(set.len(), 1);
        let record = &set.records()[0];
        assert_eq!(record.title, "Under the Dome");
        assert_eq!(record.genres.len(), 2);
        assert_eq!(record.cast.len(), 1);
        assert_eq!(record.providers.len(), 1);
        assert_eq!(record.overview.as_deref(), Some("A small town is sealed off."));
        assert_eq!(record.field_sources.overview, Some(SourceId::Tvmaze));
        assert!(record.match_keys.contains("tvmaze:1"));
        assert_eq!(record.category.len(), 2);
    }

    #[test]
    fn budget_and_revenue_fill_in_from_a_later_tmdb_page() {
        let mut wiki = draft(SourceId::Wikidata, "films", "The Matrix", Some(1999));
        wiki.external_ids.push(ExternalId::imdb("tt0133093"));
        let mut tmdb = draft(SourceId::Tmdb, "movie/popular", "The Matrix", Some(1999));
        tmdb.external_ids.push(ExternalId::imdb("tt0133093"));
        tmdb.budget = Some(63_000_000);
        tmdb.revenue = Some(463_517_383);

        let mut set = RecordSet::default();
        set.merge(&wiki);
        assert_eq!(set.records()[0].budget, None);
        assert_eq!(set.merge(&tmdb), MergeOutcome::Merged { changed: true });

        let record = &set.records()[0];
        assert_eq!(record.budget, Some(63_000_000));
        assert_eq!(record.revenue, Some(463_517_383));
        assert_eq!(record.field_sources.budget, Some(SourceId::Tmdb));

        let mut later = tmdb.clone();
        later.budget = None;
        assert_eq!(set.merge(&later), MergeOutcome::Merged { changed: false });
        assert_eq!(set.records()[0].budget, Some(63_000_000));
    }

    #[test]
    fn external_id_match_wins_over_title() {
        let mut first = draft(SourceId::Wikidata, "films", "The Matrix", Some(1999));
        first.external_ids.push(ExternalId::imdb("tt0133093"));
        let mut renamed = draft(SourceId::Tmdb, "movie/top_rated", "Matrix", Some(1999));
        renamed.external_ids.push(ExternalId::imdb("tt0133093"));

        let mut set = RecordSet::default();
        set.merge(&first);
        set.merge(&renamed);
        assert_eq!(set.len(), 1);
        assert_eq!(set.records()[0].title, "Matrix");
        assert_eq!(set.records()[0].identity_key, "imdb:tt0133093");
    }

    #[test]
    fn conflicting_imdb_ids_stay_separate() {
        let mut a = draft(SourceId::Tmdb, "movie/popular", "Halloween", Some(2018));
        a.external_ids.push(ExternalId::imdb("tt1502407"));
        let mut b = draft(SourceId::Wikidata, "films", "Halloween", Some(2018));
        b.external_ids.push(ExternalId::imdb("tt9999999"));

        let mut set = RecordSet::default();
        set.merge(&a);
        assert_eq!(set.merge(&b), MergeOutcome::Inserted);
        assert_eq!(set.len(), 2);
        assert!(!set.records()[1].match_keys.contains("title:halloween|2018"));
    }

    #[test]
    fn trailer_invariant_holds_after_many_merges() {
        let mut set = RecordSet::default();
        for (i, official) in [false, false, true, false, true].into_iter().enumerate() {
            let mut d = draft(SourceId::Tmdb, "movie/popular", "Heat", Some(1995));
            d.trailers.push(trailer(&format!("t{i}"), official));
            set.merge(&d);
        }
        let trailers = &set.records()[0].trailers;
        assert_eq!(trailers.len(), 2);
        assert!(trailers.iter().all(|t| t.is_official));
        assert_eq!(trailers[0].url, "t2");
    }

    #[test]
    fn index_is_rebuilt_from_persisted_match_keys() {
        let mut d = draft(SourceId::Tvmaze, "shows", "Lost", Some(2004));
        d.external_ids.push(ExternalId::new("tvmaze", "123"));
        let mut set = RecordSet::default();
        set.merge(&d);

        let mut reloaded = RecordSet::from_records(set.into_records());
        let mut retitled = draft(SourceId::Tvmaze, "shows", "LOST (2004)", None);
        retitled.external_ids.push(ExternalId::new("tvmaze", "123"));
        assert_eq!(reloaded.merge(&retitled), MergeOutcome::Merged { changed: false });
        assert_eq!(reloaded.len(), 1);
    }
}
