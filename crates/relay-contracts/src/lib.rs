use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const API_VERSION: &str = "1.0.0";

/// Path on the case host that accepts action payloads.
pub const PROCESS_API_PAYLOAD_PATH: &str = "/api/process-api-payload";
/// Path on the case host that accepts change messages.
pub const CHANGE_MESSAGE_PATH: &str = "/api/db-change-message/process";

pub const ACTION_TYPE_KEY: &str = "actionType";
pub const CORRELATION_ID_KEY: &str = "mefeAPIRequestId";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    CreateUnit,
    CreateUser,
    EditUser,
    EditUnit,
    AssignRole,
    DeassignRole,
}

impl ActionType {
    pub const ALL: [ActionType; 6] = [
        ActionType::CreateUnit,
        ActionType::CreateUser,
        ActionType::EditUser,
        ActionType::EditUnit,
        ActionType::AssignRole,
        ActionType::DeassignRole,
    ];

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::CreateUnit => "CREATE_UNIT",
            ActionType::CreateUser => "CREATE_USER",
            ActionType::EditUser => "EDIT_USER",
            ActionType::EditUnit => "EDIT_UNIT",
            ActionType::AssignRole => "ASSIGN_ROLE",
            ActionType::DeassignRole => "DEASSIGN_ROLE",
        }
    }

    /// Wire name of the request id that is meaningful for this action type.
    pub fn request_id_field(self) -> &'static str {
        match self {
            ActionType::CreateUnit => "unitCreationRequestId",
            ActionType::CreateUser => "userCreationRequestId",
            ActionType::EditUser => "updateUserRequestId",
            ActionType::EditUnit => "updateUnitRequestId",
            ActionType::AssignRole => "idMapUserUnitPermission",
            ActionType::DeassignRole => "removeUserFromUnitRequestId",
        }
    }

    /// Stored procedure that records the API outcome for this action type.
    pub fn reply_procedure(self) -> &'static str {
        match self {
            ActionType::CreateUnit => "ut_creation_unit_mefe_api_reply",
            ActionType::CreateUser => "ut_creation_user_mefe_api_reply",
            ActionType::EditUser => "ut_update_user_mefe_api_reply",
            ActionType::EditUnit => "ut_update_unit_mefe_api_reply",
            ActionType::AssignRole => "ut_creation_user_role_association_mefe_api_reply",
            ActionType::DeassignRole => "ut_remove_user_role_association_mefe_api_reply",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One variant per action type, each carrying only the id that type needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionRequest {
    CreateUnit { unit_creation_request_id: i64 },
    CreateUser { user_creation_request_id: i64 },
    EditUser { update_user_request_id: i64 },
    EditUnit { update_unit_request_id: i64 },
    AssignRole { id_map_user_unit_permission: i64 },
    DeassignRole { remove_user_from_unit_request_id: i64 },
}

impl ActionRequest {
    pub fn new(action_type: ActionType, request_id: i64) -> Self {
        match action_type {
            ActionType::CreateUnit => ActionRequest::CreateUnit {
                unit_creation_request_id: request_id,
            },
            ActionType::CreateUser => ActionRequest::CreateUser {
                user_creation_request_id: request_id,
            },
            ActionType::EditUser => ActionRequest::EditUser {
                update_user_request_id: request_id,
            },
            ActionType::EditUnit => ActionRequest::EditUnit {
                update_unit_request_id: request_id,
            },
            ActionType::AssignRole => ActionRequest::AssignRole {
                id_map_user_unit_permission: request_id,
            },
            ActionType::DeassignRole => ActionRequest::DeassignRole {
                remove_user_from_unit_request_id: request_id,
            },
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            ActionRequest::CreateUnit { .. } => ActionType::CreateUnit,
            ActionRequest::CreateUser { .. } => ActionType::CreateUser,
            ActionRequest::EditUser { .. } => ActionType::EditUser,
            ActionRequest::EditUnit { .. } => ActionType::EditUnit,
            ActionRequest::AssignRole { .. } => ActionType::AssignRole,
            ActionRequest::DeassignRole { .. } => ActionType::DeassignRole,
        }
    }

    pub fn request_id(&self) -> i64 {
        match *self {
            ActionRequest::CreateUnit {
                unit_creation_request_id: id,
            }
            | ActionRequest::CreateUser {
                user_creation_request_id: id,
            }
            | ActionRequest::EditUser {
                update_user_request_id: id,
            }
            | ActionRequest::EditUnit {
                update_unit_request_id: id,
            }
            | ActionRequest::AssignRole {
                id_map_user_unit_permission: id,
            }
            | ActionRequest::DeassignRole {
                remove_user_from_unit_request_id: id,
            } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEvent {
    pub correlation_id: String,
    pub request: ActionRequest,
}

impl ActionEvent {
    pub fn action_type(&self) -> ActionType {
        self.request.action_type()
    }

    pub fn request_id(&self) -> i64 {
        self.request.request_id()
    }
}

/// Body the case API returns on 200/201. Every field is optional on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CaseApiBody {
    pub id: Option<String>,
    #[serde(rename = "unitMongoId")]
    pub unit_mongo_id: Option<String>,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub timestamp: Option<String>,
    #[serde(rename = "mefeApiKey")]
    pub mefe_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
