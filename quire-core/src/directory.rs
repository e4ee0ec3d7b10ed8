//! Reference entities a document can point at.
//!
//! These are owned by the wider application; only the fields needed to
//! resolve a document's context are modelled here.

use serde::{Deserialize, Serialize};

use crate::model::{ClientId, DepartmentId, ProjectId, SprintId, TaskId, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub id: DepartmentId,
    pub client_id: Option<ClientId>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub client_id: Option<ClientId>,
    pub department_id: Option<DepartmentId>,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Manager,
    Member,
    Client,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub role: UserRole,
    #[serde(default)]
    pub department_ids: Vec<DepartmentId>,
}

impl User {
    /// A client-role user who belongs to the given department.
    pub fn is_client_of(&self, department_id: DepartmentId) -> bool {
        self.role == UserRole::Client && self.department_ids.contains(&department_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Review,
    Done,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub sprint_id: Option<SprintId>,
    pub title: String,
    pub status: TaskStatus,
}
