//! Core domain model and canonical ordering for cinesync.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cinesync-core";

/// Null marker used by the source dataset for absent fields.
pub const NULL_SENTINEL: &str = "\\N";

/// Canonical titled-work record. `genres` keeps the source casing; all
/// equality and ordering decisions go through [`canonical_cmp`], which
/// compares titles and genres case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Work {
    pub title: String,
    pub year: Option<i32>,
    pub runtime_minutes: Option<i32>,
    pub genres: String,
}

impl Work {
    /// Parse one raw row into a `Work`, or reject it.
    ///
    /// Rows that fail the type/adult filter, or that lack a usable title,
    /// are skipped silently (`None`). Unparsable year/runtime values are
    /// treated as absent, never as an error.
    pub fn from_row(row: &RawRow, schema: &RowSchema) -> Option<Work> {
        if row.get(&schema.title_type_column) != Some(schema.title_type.as_str()) {
            return None;
        }
        if row.get(&schema.is_adult_column) != Some(schema.is_adult.as_str()) {
            return None;
        }

        let title = row
            .get(&schema.title_column)
            .map(str::trim)
            .filter(|t| !t.is_empty() && *t != NULL_SENTINEL)?;

        let genres = match row.get(&schema.genres_column).map(str::trim) {
            Some(g) if !g.is_empty() && g != NULL_SENTINEL => g.to_string(),
            _ => String::new(),
        };

        Some(Work {
            title: title.to_string(),
            year: parse_optional_i32(row.get(&schema.year_column)),
            runtime_minutes: parse_optional_i32(row.get(&schema.runtime_column)),
            genres,
        })
    }

    /// True when two works are duplicates under the canonical ordering.
    pub fn same_key(&self, other: &Work) -> bool {
        canonical_cmp(self, other) == Ordering::Equal
    }
}

/// Column names and filter values for the source row layout.
///
/// These were ambient globals in earlier incarnations of the importer; they
/// are explicit configuration now so alternate dumps can be ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowSchema {
    pub title_type_column: String,
    pub is_adult_column: String,
    pub title_column: String,
    pub year_column: String,
    pub runtime_column: String,
    pub genres_column: String,
    pub title_type: String,
    pub is_adult: String,
}

impl Default for RowSchema {
    fn default() -> Self {
        Self {
            title_type_column: "titleType".to_string(),
            is_adult_column: "isAdult".to_string(),
            title_column: "primaryTitle".to_string(),
            year_column: "startYear".to_string(),
            runtime_column: "runtimeMinutes".to_string(),
            genres_column: "genres".to_string(),
            title_type: "movie".to_string(),
            is_adult: "0".to_string(),
        }
    }
}

/// Column-name index shared by every row of one dataset pass.
#[derive(Debug, Clone, Default)]
pub struct Header {
    index: HashMap<String, usize>,
}

impl Header {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let index = columns
            .into_iter()
            .enumerate()
            .map(|(position, column)| (column.into(), position))
            .collect();
        Self { index }
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }
}

/// One raw tab-separated record, viewed as a column-name -> value mapping.
#[derive(Debug, Clone)]
pub struct RawRow {
    header: Arc<Header>,
    values: Vec<String>,
}

impl RawRow {
    pub fn new(header: Arc<Header>, values: Vec<String>) -> Self {
        Self { header, values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.header
            .position(column)
            .and_then(|position| self.values.get(position))
            .map(String::as_str)
    }
}

/// The single total order used by every sort, merge, and diff in the
/// pipeline: title, then year, then runtime, then genres. Title and genres
/// compare case-insensitively; an absent year/runtime sorts before any
/// present value (`Option`'s derived order).
pub fn canonical_cmp(a: &Work, b: &Work) -> Ordering {
    casefold_cmp(&a.title, &b.title)
        .then_with(|| a.year.cmp(&b.year))
        .then_with(|| a.runtime_minutes.cmp(&b.runtime_minutes))
        .then_with(|| casefold_cmp(&a.genres, &b.genres))
}

/// Case-insensitive lexicographic comparison without allocating.
fn casefold_cmp(a: &str, b: &str) -> Ordering {
    a.chars()
        .flat_map(char::to_lowercase)
        .cmp(b.chars().flat_map(char::to_lowercase))
}

fn parse_optional_i32(value: Option<&str>) -> Option<i32> {
    let value = value?.trim();
    if value.is_empty() || value == NULL_SENTINEL {
        return None;
    }
    value.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn header() -> Arc<Header> {
        Arc::new(Header::new([
            "tconst",
            "titleType",
            "primaryTitle",
            "originalTitle",
            "isAdult",
            "startYear",
            "endYear",
            "runtimeMinutes",
            "genres",
        ]))
    }

    fn row(values: &[&str]) -> RawRow {
        RawRow::new(header(), values.iter().map(|v| v.to_string()).collect())
    }

    fn work(title: &str, year: Option<i32>, runtime: Option<i32>, genres: &str) -> Work {
        Work {
            title: title.to_string(),
            year,
            runtime_minutes: runtime,
            genres: genres.to_string(),
        }
    }

    #[test]
    fn movie_row_normalizes() {
        let schema = RowSchema::default();
        let parsed = Work::from_row(
            &row(&[
                "tt0000001",
                "movie",
                "Alpha",
                "Alpha",
                "0",
                "2000",
                "",
                "90",
                "Drama",
            ]),
            &schema,
        )
        .expect("movie row should parse");
        assert_eq!(parsed, work("Alpha", Some(2000), Some(90), "Drama"));
    }

    #[test]
    fn non_movie_and_adult_rows_are_filtered() {
        let schema = RowSchema::default();
        let series = row(&[
            "tt1", "tvSeries", "Alpha", "Alpha", "0", "2000", "", "90", "Drama",
        ]);
        let adult = row(&[
            "tt2", "movie", "Alpha", "Alpha", "1", "2000", "", "90", "Drama",
        ]);
        assert!(Work::from_row(&series, &schema).is_none());
        assert!(Work::from_row(&adult, &schema).is_none());
    }

    #[test]
    fn null_and_malformed_numerics_become_absent() {
        let schema = RowSchema::default();
        let parsed = Work::from_row(
            &row(&[
                "tt3", "movie", "Alpha", "Alpha", "0", "\\N", "", "ninety", "\\N",
            ]),
            &schema,
        )
        .expect("row with absent numerics still parses");
        assert_eq!(parsed.year, None);
        assert_eq!(parsed.runtime_minutes, None);
        assert_eq!(parsed.genres, "");
    }

    #[test]
    fn missing_or_empty_title_rejects_the_row() {
        let schema = RowSchema::default();
        let empty = row(&["tt4", "movie", "  ", "x", "0", "2000", "", "90", "Drama"]);
        let null = row(&["tt5", "movie", "\\N", "x", "0", "2000", "", "90", "Drama"]);
        assert!(Work::from_row(&empty, &schema).is_none());
        assert!(Work::from_row(&null, &schema).is_none());
    }

    #[test]
    fn case_variants_share_a_key() {
        let a = work("Alpha", Some(2000), Some(90), "Drama");
        let b = work("alpha", Some(2000), Some(90), "drama");
        assert!(a.same_key(&b));
        assert!(!a.same_key(&work("Beta", Some(2000), Some(90), "Drama")));
    }

    #[test]
    fn absent_year_sorts_before_any_present_year() {
        let absent = work("Alpha", None, Some(90), "Drama");
        let present = work("Alpha", Some(1880), Some(90), "Drama");
        assert_eq!(canonical_cmp(&absent, &present), Ordering::Less);
    }

    fn work_strategy() -> impl Strategy<Value = Work> {
        (
            "[A-Za-z ]{0,8}",
            proptest::option::of(1880..2030i32),
            proptest::option::of(1..500i32),
            "[A-Za-z,]{0,12}",
        )
            .prop_map(|(title, year, runtime, genres)| Work {
                title,
                year,
                runtime_minutes: runtime,
                genres,
            })
    }

    proptest! {
        #[test]
        fn canonical_order_is_a_strict_total_order(
            a in work_strategy(),
            b in work_strategy(),
            c in work_strategy(),
        ) {
            prop_assert_eq!(canonical_cmp(&a, &a), Ordering::Equal);
            prop_assert_eq!(canonical_cmp(&a, &b), canonical_cmp(&b, &a).reverse());
            if canonical_cmp(&a, &b) != Ordering::Greater
                && canonical_cmp(&b, &c) != Ordering::Greater
            {
                prop_assert_ne!(canonical_cmp(&a, &c), Ordering::Greater);
            }
        }
    }
}
