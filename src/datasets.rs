//! Loading raw rating dumps from disk.
use std::collections::HashMap;
use std::path::Path;

use crate::dataset::{DatasetError, RatingTriplet};
use crate::RawId;

/// Read a headerless `user_id,work_id,choice` CSV file.
pub fn load_triplets<P: AsRef<Path>>(path: P) -> Result<Vec<RatingTriplet>, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;

    let triplets = reader
        .deserialize()
        .map(|record| {
            let (user_id, work_id, choice): (RawId, RawId, String) = record?;
            Ok(RatingTriplet::new(user_id, work_id, choice))
        })
        .collect::<Result<Vec<_>, DatasetError>>()?;

    tracing::info!(path = ?path.as_ref(), nb_ratings = triplets.len(), "loaded triplets");
    Ok(triplets)
}

/// Titles and categories of works.
pub type WorkMetadata = (HashMap<RawId, String>, HashMap<RawId, String>);

/// Read a headerless `work_id,title[,category]` CSV file.
pub fn load_works<P: AsRef<Path>>(path: P) -> Result<WorkMetadata, DatasetError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;

    let mut titles = HashMap::new();
    let mut categories = HashMap::new();
    for record in reader.records() {
        let record = record?;
        if record.len() > 2 {
            let (work_id, title, category): (RawId, String, String) = record.deserialize(None)?;
            titles.insert(work_id, title);
            categories.insert(work_id, category);
        } else {
            let (work_id, title): (RawId, String) = record.deserialize(None)?;
            titles.insert(work_id, title);
        }
    }

    Ok((titles, categories))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn reads_triplets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratings.csv");
        fs::write(&path, "1,10,like\n2, 10, favorite\n2,11,wontsee\n").unwrap();

        let triplets = load_triplets(&path).unwrap();
        assert_eq!(
            triplets,
            vec![
                RatingTriplet::new(1, 10, "like"),
                RatingTriplet::new(2, 10, "favorite"),
                RatingTriplet::new(2, 11, "wontsee"),
            ]
        );
    }

    #[test]
    fn malformed_lines_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratings.csv");
        fs::write(&path, "1,ten,like\n").unwrap();

        assert!(load_triplets(&path).is_err());
    }

    #[test]
    fn reads_works_with_optional_categories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("works.csv");
        fs::write(&path, "10,Cowboy Bebop,anime\n11,Berserk\n").unwrap();

        let (titles, categories) = load_works(&path).unwrap();
        assert_eq!(titles[&11], "Berserk");
        assert_eq!(categories[&10], "anime");
        assert!(!categories.contains_key(&11));
    }
}
