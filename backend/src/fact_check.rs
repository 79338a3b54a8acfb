use async_trait::async_trait;
use movie_game_core::{MoveKind, ProposedMove, SubjectId};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub id: SubjectId,
    pub name: String,
    pub photo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactCheck {
    pub is_match: bool,
    pub movie: Option<Subject>,
    pub person: Option<Subject>,
}

#[derive(Debug, thiserror::Error)]
pub enum FactCheckError {
    #[error("fact-checker request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected fact-checker response: {0}")]
    Unexpected(String),
}

#[async_trait]
pub trait FactChecker: Send + Sync {
    async fn check_person_in_movie(
        &self,
        movie_id: SubjectId,
        person_id: SubjectId,
    ) -> Result<FactCheck, FactCheckError>;

    async fn movie(&self, id: SubjectId) -> Result<Option<Subject>, FactCheckError>;

    async fn person(&self, id: SubjectId) -> Result<Option<Subject>, FactCheckError>;

    async fn search_movies(&self, query: &str) -> Result<Vec<Subject>, FactCheckError>;

    async fn search_people(&self, query: &str) -> Result<Vec<Subject>, FactCheckError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub correct: bool,
    pub display_name: String,
    pub photo: Option<String>,
}

/// With both sides named, the pairing decides. A chain opener names only its
/// subject and is correct when that subject exists.
pub async fn judge(
    checker: &dyn FactChecker,
    proposal: &ProposedMove,
) -> Result<Verdict, FactCheckError> {
    let subject_id = proposal
        .subject_id()
        .ok_or_else(|| FactCheckError::Unexpected("proposal has no subject".into()))?;

    let (correct, subject) = match (proposal.movie_id, proposal.person_id) {
        (Some(movie_id), Some(person_id)) => {
            let check = checker.check_person_in_movie(movie_id, person_id).await?;
            let side = match proposal.kind {
                MoveKind::Movie => check.movie,
                MoveKind::Person => check.person,
            };
            let side = match side {
                Some(side) => Some(side),
                None => lookup(checker, proposal.kind, subject_id).await?,
            };
            (check.is_match, side)
        }
        _ => {
            let side = lookup(checker, proposal.kind, subject_id).await?;
            (side.is_some(), side)
        }
    };

    Ok(match subject {
        Some(subject) => Verdict {
            correct,
            display_name: subject.name,
            photo: subject.photo,
        },
        None => Verdict {
            correct: false,
            display_name: match proposal.kind {
                MoveKind::Movie => format!("Unknown movie #{subject_id}"),
                MoveKind::Person => format!("Unknown person #{subject_id}"),
            },
            photo: None,
        },
    })
}

async fn lookup(
    checker: &dyn FactChecker,
    kind: MoveKind,
    id: SubjectId,
) -> Result<Option<Subject>, FactCheckError> {
    match kind {
        MoveKind::Movie => checker.movie(id).await,
        MoveKind::Person => checker.person(id).await,
    }
}

#[derive(Debug, Clone)]
pub struct TmdbConfig {
    pub api_url: String,
    pub api_key: String,
    pub image_base: String,
}

#[derive(Deserialize)]
struct MovieDetails {
    id: SubjectId,
    title: String,
    poster_path: Option<String>,
    #[serde(default)]
    credits: Option<Credits>,
}

#[derive(Deserialize)]
struct Credits {
    #[serde(default)]
    cast: Vec<PersonDetails>,
}

#[derive(Deserialize)]
struct PersonDetails {
    id: SubjectId,
    name: String,
    profile_path: Option<String>,
}

#[derive(Deserialize)]
struct SearchPage<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

pub struct TmdbClient {
    http: reqwest::Client,
    config: TmdbConfig,
}

impl TmdbClient {
    pub fn new(config: TmdbConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn photo(&self, path: Option<String>) -> Option<String> {
        path.map(|p| format!("{}{}", self.config.image_base.trim_end_matches('/'), p))
    }

    fn movie_subject(&self, movie: MovieDetails) -> Subject {
        Subject {
            id: movie.id,
            name: movie.title,
            photo: self.photo(movie.poster_path),
        }
    }

    fn person_subject(&self, person: PersonDetails) -> Subject {
        Subject {
            id: person.id,
            name: person.name,
            photo: self.photo(person.profile_path),
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<Option<T>, FactCheckError> {
        let url = format!("{}/3/{}", self.config.api_url.trim_end_matches('/'), path);
        let response = self
            .http
            .get(url)
            .query(&[("api_key", self.config.api_key.as_str())])
            .query(params)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?.json().await?))
    }
}

#[async_trait]
impl FactChecker for TmdbClient {
    async fn check_person_in_movie(
        &self,
        movie_id: SubjectId,
        person_id: SubjectId,
    ) -> Result<FactCheck, FactCheckError> {
        let Some(mut movie) = self
            .fetch::<MovieDetails>(&format!("movie/{movie_id}"), &[("append_to_response", "credits")])
            .await?
        else {
            return Ok(FactCheck {
                is_match: false,
                movie: None,
                person: None,
            });
        };

        let cast = movie.credits.take().map(|c| c.cast).unwrap_or_default();
        let person = cast.into_iter().find(|p| p.id == person_id);
        tracing::debug!(movie_id, person_id, is_match = person.is_some(), "checked cast");

        Ok(FactCheck {
            is_match: person.is_some(),
            movie: Some(self.movie_subject(movie)),
            person: person.map(|p| self.person_subject(p)),
        })
    }

    async fn movie(&self, id: SubjectId) -> Result<Option<Subject>, FactCheckError> {
        let movie = self.fetch::<MovieDetails>(&format!("movie/{id}"), &[]).await?;
        Ok(movie.map(|m| self.movie_subject(m)))
    }

    async fn person(&self, id: SubjectId) -> Result<Option<Subject>, FactCheckError> {
        let person = self.fetch::<PersonDetails>(&format!("person/{id}"), &[]).await?;
        Ok(person.map(|p| self.person_subject(p)))
    }

    async fn search_movies(&self, query: &str) -> Result<Vec<Subject>, FactCheckError> {
        let page = self
            .fetch::<SearchPage<MovieDetails>>("search/movie", &[("query", query)])
            .await?
            .ok_or_else(|| FactCheckError::Unexpected("movie search not found".into()))?;
        Ok(page.results.into_iter().map(|m| self.movie_subject(m)).collect())
    }

    async fn search_people(&self, query: &str) -> Result<Vec<Subject>, FactCheckError> {
        let page = self
            .fetch::<SearchPage<PersonDetails>>("search/person", &[("query", query)])
            .await?
            .ok_or_else(|| FactCheckError::Unexpected("person search not found".into()))?;
        Ok(page.results.into_iter().map(|p| self.person_subject(p)).collect())
    }
}
