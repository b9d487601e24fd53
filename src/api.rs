//! HTTP surface over the engine.

use std::collections::HashSet;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::aggregate::AttemptSet;
use crate::analytics::PerformanceAnalyzer;
use crate::classifier::{
    classifier_for, classify_students, classify_summaries, ClassificationStrategy, RuleClassifier,
};
use crate::config::EngineConfig;
use crate::data::{load_attempts, AttemptRow};
use crate::database::{Database, Repository};
use crate::error::EngineError;
use crate::improvement::{
    course_progress, forecast_next_score, improvements_for_student, most_improved,
    overall_improvement, progress_for_student, CompletionStatus, CourseProgress,
    ImprovementTracker,
};
use crate::mentor::{
    mentees_for_mentor, pair_within_courses, pairings_for_mentee, MentorMatcher,
};
use crate::model::{CourseSummary, ImprovementRecord, PerformanceLabel};
use crate::recommend::{summary_action, RecommendationEngine};

type ApiResult = Result<HttpResponse, EngineError>;
pub type SharedState = web::Data<RwLock<AppState>>;

impl ResponseError for EngineError {
    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::UnknownStudent(_) | EngineError::NoAttempts { .. } => {
                StatusCode::NOT_FOUND
            }
            EngineError::MissingFields { .. }
            | EngineError::UnrecognizedSchema { .. }
            | EngineError::Csv(_)
            | EngineError::Serialization(_) => StatusCode::BAD_REQUEST,
            EngineError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

/// Everything the server holds between requests.
pub struct AppState {
    pub config: EngineConfig,
    pub attempts: AttemptSet,
    pub db: Database,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadSummary {
    pub attempts: usize,
    pub students: usize,
    pub recommendations: usize,
    pub new_pairings: usize,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            attempts: AttemptSet::default(),
            db: Database::new(),
        }
    }

    /// Replaces the attempt snapshot and refreshes stored recommendations
    /// and pairings from it.
    pub fn ingest(&mut self, rows: Vec<AttemptRow>) -> Result<LoadSummary, EngineError> {
        let attempts = AttemptSet::from_rows(rows, &self.config)?;
        let students: HashSet<&str> = attempts.student_ids().into_iter().collect();
        let stale = self
            .db
            .recommendations
            .delete(&|r| !students.contains(r.student_id.as_str()));
        if stale > 0 {
            debug!(stale, "removed recommendations for students no longer loaded");
        }
        let recommendations = RecommendationEngine::new(&self.config)
            .regenerate_all(&mut self.db.recommendations, &attempts)?;
        let new_pairings = MentorMatcher::new(&self.config)
            .generate_pairings(&mut self.db.pairings, &attempts)
            .len();

        let summary = LoadSummary {
            attempts: attempts.len(),
            students: students.len(),
            recommendations,
            new_pairings,
        };
        self.attempts = attempts;
        info!(attempts = summary.attempts, students = summary.students, "loaded attempts");
        Ok(summary)
    }
}

#[derive(Serialize)]
struct SummaryRow {
    #[serde(flatten)]
    summary: CourseSummary,
    label: PerformanceLabel,
    action: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StudentProgress {
    pub student_id: String,
    pub improvements: Vec<ImprovementRecord>,
    pub courses: Vec<CourseProgress>,
}

#[derive(Deserialize)]
struct ClassificationQuery {
    #[serde(default)]
    strategy: ClassificationStrategy,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct TrackRequest {
    student_id: String,
    course_id: String,
    status: CompletionStatus,
    #[serde(default)]
    completion_percentage: f64,
    estimated_completion: Option<String>,
}

#[derive(Deserialize)]
struct CourseRequest {
    student_id: String,
    course_id: String,
    completed_at: Option<NaiveDateTime>,
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().body("Performance engine is running")
}

async fn load_json(state: SharedState, rows: web::Json<Vec<AttemptRow>>) -> ApiResult {
    let summary = state.write().await.ingest(rows.into_inner())?;
    Ok(HttpResponse::Ok().json(summary))
}

async fn load_csv(state: SharedState, body: String) -> ApiResult {
    let rows = load_attempts(body.as_bytes())?;
    let summary = state.write().await.ingest(rows)?;
    Ok(HttpResponse::Ok().json(summary))
}

async fn get_summaries(state: SharedState) -> HttpResponse {
    let state = state.read().await;
    let rule = RuleClassifier::new(state.config.thresholds);
    let rows: Vec<SummaryRow> = classify_summaries(&state.attempts.summaries(), &rule)
        .into_iter()
        .map(|classified| SummaryRow {
            action: summary_action(classified.label, &classified.summary.course_name),
            label: classified.label,
            summary: classified.summary,
        })
        .collect();
    HttpResponse::Ok().json(rows)
}

async fn get_classification(
    state: SharedState,
    query: web::Query<ClassificationQuery>,
) -> ApiResult {
    let state = state.read().await;
    let classifier = classifier_for(query.strategy, &state.config);
    Ok(HttpResponse::Ok().json(classify_students(&state.attempts, classifier.as_ref())?))
}

async fn get_analysis(state: SharedState, path: web::Path<String>) -> ApiResult {
    let state = state.read().await;
    let analysis =
        PerformanceAnalyzer::new(&state.config).analyze_student(&state.attempts, &path)?;
    Ok(HttpResponse::Ok().json(analysis))
}

async fn get_recommendations(state: SharedState, path: web::Path<String>) -> ApiResult {
    let state = state.read().await;
    let student_id = path.into_inner();
    if state.attempts.for_student(&student_id).is_empty() {
        return Err(EngineError::UnknownStudent(student_id));
    }
    let mut recommendations = state.db.recommendations.query(&|r| r.student_id == student_id);
    recommendations.sort_by_key(|r| r.priority);
    Ok(HttpResponse::Ok().json(recommendations))
}

async fn get_peer_recommendations(state: SharedState, path: web::Path<String>) -> ApiResult {
    let state = state.read().await;
    let peers =
        RecommendationEngine::new(&state.config).peer_recommendations(&state.attempts, &path)?;
    Ok(HttpResponse::Ok().json(peers))
}

async fn get_mentors(state: SharedState, path: web::Path<String>) -> ApiResult {
    let state = state.read().await;
    let matches =
        MentorMatcher::new(&state.config).match_by_similarity(&state.attempts, &path)?;
    Ok(HttpResponse::Ok().json(matches))
}

async fn get_pairings(state: SharedState, path: web::Path<String>) -> HttpResponse {
    let state = state.read().await;
    HttpResponse::Ok().json(pairings_for_mentee(&state.db.pairings, &path))
}

async fn get_mentees(state: SharedState, path: web::Path<String>) -> HttpResponse {
    let state = state.read().await;
    HttpResponse::Ok().json(mentees_for_mentor(&state.db.pairings, &path))
}

async fn get_forecast(state: SharedState, path: web::Path<String>) -> ApiResult {
    let state = state.read().await;
    Ok(HttpResponse::Ok().json(forecast_next_score(&state.attempts, &path)?))
}

async fn get_improvement(state: SharedState, path: web::Path<String>) -> ApiResult {
    let state = state.read().await;
    Ok(HttpResponse::Ok().json(overall_improvement(&state.attempts, &path)?))
}

async fn get_student_progress(state: SharedState, path: web::Path<String>) -> HttpResponse {
    let state = state.read().await;
    let student_id = path.into_inner();
    HttpResponse::Ok().json(StudentProgress {
        improvements: improvements_for_student(&state.db.improvements, &student_id),
        courses: progress_for_student(&state.db.progress, &student_id),
        student_id,
    })
}

async fn get_simple_pairings(state: SharedState) -> HttpResponse {
    let state = state.read().await;
    let rule = RuleClassifier::new(state.config.thresholds);
    let classified = classify_summaries(&state.attempts.summaries(), &rule);
    HttpResponse::Ok().json(pair_within_courses(&classified))
}

async fn get_progress(state: SharedState) -> HttpResponse {
    let state = state.read().await;
    HttpResponse::Ok().json(course_progress(&state.attempts))
}

async fn track_progress(state: SharedState, req: web::Json<TrackRequest>) -> ApiResult {
    let mut guard = state.write().await;
    let state = &mut *guard;
    let req = req.into_inner();
    let progress = ImprovementTracker::new(&state.config).track(
        &mut state.db.progress,
        &req.student_id,
        &req.course_id,
        req.status,
        req.completion_percentage,
        req.estimated_completion,
    )?;
    Ok(HttpResponse::Ok().json(progress))
}

async fn complete_course(state: SharedState, req: web::Json<CourseRequest>) -> ApiResult {
    let mut guard = state.write().await;
    let state = &mut *guard;
    let completed_at = req.completed_at.unwrap_or_else(|| Utc::now().naive_utc());
    let record = ImprovementTracker::new(&state.config).complete(
        &mut state.db.progress,
        &mut state.db.improvements,
        &state.attempts,
        &req.student_id,
        &req.course_id,
        completed_at,
    )?;
    Ok(HttpResponse::Created().json(record))
}

async fn abandon_course(state: SharedState, req: web::Json<CourseRequest>) -> ApiResult {
    let mut guard = state.write().await;
    let state = &mut *guard;
    let progress = ImprovementTracker::new(&state.config).abandon(
        &mut state.db.progress,
        &req.student_id,
        &req.course_id,
    )?;
    Ok(HttpResponse::Ok().json(progress))
}

async fn get_most_improved(state: SharedState, query: web::Query<LimitQuery>) -> HttpResponse {
    let state = state.read().await;
    let limit = query.limit.unwrap_or(state.config.most_improved_limit);
    HttpResponse::Ok().json(most_improved(&state.db.improvements.all(), limit))
}

async fn get_analytics(state: SharedState) -> HttpResponse {
    let state = state.read().await;
    let overview = PerformanceAnalyzer::new(&state.config).class_overview(&state.attempts);
    HttpResponse::Ok().json(overview)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/attempts", web::post().to(load_json))
        .route("/attempts/csv", web::post().to(load_csv))
        .route("/summaries", web::get().to(get_summaries))
        .route("/classification", web::get().to(get_classification))
        .route("/students/{id}/analysis", web::get().to(get_analysis))
        .route("/students/{id}/recommendations", web::get().to(get_recommendations))
        .route(
            "/students/{id}/peer-recommendations",
            web::get().to(get_peer_recommendations),
        )
        .route("/students/{id}/mentors", web::get().to(get_mentors))
        .route("/students/{id}/pairings", web::get().to(get_pairings))
        .route("/students/{id}/mentees", web::get().to(get_mentees))
        .route("/students/{id}/forecast", web::get().to(get_forecast))
        .route("/students/{id}/improvement", web::get().to(get_improvement))
        .route("/students/{id}/progress", web::get().to(get_student_progress))
        .route("/pairings/simple", web::get().to(get_simple_pairings))
        .route("/progress", web::get().to(get_progress))
        .route("/progress/track", web::post().to(track_progress))
        .route("/progress/complete", web::post().to(complete_course))
        .route("/progress/abandon", web::post().to(abandon_course))
        .route("/improvement/most-improved", web::get().to(get_most_improved))
        .route("/analytics", web::get().to(get_analytics));
}
