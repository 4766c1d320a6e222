/// Database row types — these map directly to SQLite rows.

pub struct TechnicianRow {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub created_at: String,
}

pub struct UnattendedEndpointRow {
    pub endpoint_id: String,
    pub verifier_hash: String,
    pub created_at: String,
    pub updated_at: String,
}
