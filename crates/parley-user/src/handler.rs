//! Delivery of permission, feedback, and confirmation requests to a human.
//! The console handler blocks on stdin; default auto-responses drive batch
//! scenarios without a terminal.

use async_trait::async_trait;
use parley_agent::{ConfirmationRequest, FeedbackRequest, PermissionRequest};
use parley_schema::{ConfirmationResponse, PermissionLevel};
use tokio::io::{AsyncBufReadExt, BufReader};

#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_permission_request(
        &self,
        request: PermissionRequest,
        sender: &str,
        receiver: &str,
        session_id: &str,
    );

    async fn handle_feedback_request(
        &self,
        request: FeedbackRequest,
        sender: &str,
        receiver: &str,
        session_id: &str,
    );

    async fn handle_confirmation_request(
        &self,
        request: ConfirmationRequest,
        sender: &str,
        receiver: &str,
        session_id: &str,
    );
}

pub struct ConsoleHandler {
    /// Highest permission level offered at the prompt, in 1..=3.
    upper_bound: u8,
    default_permission: Option<PermissionLevel>,
    default_confirmation: Option<bool>,
}

impl ConsoleHandler {
    pub fn new(upper_bound: u8) -> Self {
        assert!((1..=3).contains(&upper_bound), "upper_bound must be in 1..=3");
        Self {
            upper_bound,
            default_permission: None,
            default_confirmation: None,
        }
    }

    /// Auto-answer every permission request with the given level.
    pub fn with_default_permission(mut self, level: PermissionLevel) -> Self {
        self.default_permission = Some(level);
        self
    }

    /// Auto-answer every confirmation request.
    pub fn with_default_confirmation(mut self, confirmed: bool) -> Self {
        self.default_confirmation = Some(confirmed);
        self
    }

    async fn read_line(&self) -> String {
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        if reader.read_line(&mut line).await.is_err() {
            return String::new();
        }
        line.trim().to_string()
    }
}

impl Default for ConsoleHandler {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl RequestHandler for ConsoleHandler {
    async fn handle_permission_request(
        &self,
        request: PermissionRequest,
        sender: &str,
        _receiver: &str,
        session_id: &str,
    ) {
        println!("\nPermission request");
        println!("Session: {session_id}");
        println!("Sender:  {sender}");
        println!("Action:  {}", request.call());

        if let Some(level) = self.default_permission {
            request.respond(level);
            return;
        }

        loop {
            println!("\nGrant permission for this action?");
            println!("[0] Deny");
            println!("[1] Allow once (default)");
            if self.upper_bound > 1 {
                println!("[2] Allow for session");
            }
            if self.upper_bound > 2 {
                println!("[3] Allow always");
            }

            let input = self.read_line().await;
            let choice = if input.is_empty() { "1" } else { input.as_str() };
            match choice.parse::<u8>() {
                Ok(value) if value <= self.upper_bound => {
                    let level = PermissionLevel::try_from(value).expect("bounded level");
                    request.respond(level);
                    return;
                }
                _ => {
                    println!("Invalid input {choice:?}, choose from 0..={}", self.upper_bound);
                }
            }
        }
    }

    async fn handle_feedback_request(
        &self,
        request: FeedbackRequest,
        sender: &str,
        _receiver: &str,
        session_id: &str,
    ) {
        println!("\nFeedback request");
        println!("Session:  {session_id}");
        println!("Sender:   {sender}");
        println!("Question: {}", request.question);
        println!("Answer:");

        let answer = self.read_line().await;
        request.respond(answer);
    }

    async fn handle_confirmation_request(
        &self,
        request: ConfirmationRequest,
        sender: &str,
        _receiver: &str,
        session_id: &str,
    ) {
        println!("\nConfirmation request");
        println!("Session: {session_id}");
        println!("Sender:  {sender}");
        for thought in &request.thoughts {
            println!("Thinking: {thought}");
        }
        println!("Agent: {}", request.agent_name);
        println!("Query: {}", request.query);

        if let Some(confirmed) = self.default_confirmation {
            request.respond(if confirmed {
                ConfirmationResponse::confirmed()
            } else {
                ConfirmationResponse::rejected(None)
            });
            return;
        }

        loop {
            println!("\nRun agent? [y/n] (default y)");
            let input = self.read_line().await.to_lowercase();
            match input.as_str() {
                "" | "y" => {
                    request.confirm();
                    return;
                }
                "n" => {
                    println!("Comment (optional):");
                    let comment = self.read_line().await;
                    request.reject(if comment.is_empty() {
                        None
                    } else {
                        Some(comment)
                    });
                    return;
                }
                other => println!("Invalid input {other:?}, answer y or n"),
            }
        }
    }
}
