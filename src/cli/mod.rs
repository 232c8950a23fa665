pub mod args;
pub mod meetings;

use anyhow::{bail, Result};
use chrono::Utc;

use crate::app;
use crate::db::MeetingStore;
use crate::intake::Invitation;
use crate::meeting::{user_hash_key, NewUser, User};

pub use args::{
    Cli, CliCommand, ManualCliArgs, MeetingsCliArgs, MeetingsCommand, UsersCliArgs, UsersCommand,
};
pub use meetings::handle_meetings_command;

pub async fn handle_manual_command(args: ManualCliArgs) -> Result<()> {
    let invitation = Invitation {
        meeting_url: args.url,
        title: args.title,
        scheduled_time: args.at.unwrap_or_else(Utc::now),
        owner_email: args.owner,
        owner_name: None,
        owner_company: None,
        owner_role: None,
    };

    let meeting = app::run_manual(invitation).await?;

    println!("Meeting #{} finished as {}", meeting.id, meeting.status);
    if let Some(failure) = &meeting.failure {
        println!("Failed at {}: {}", failure.stage, failure.message);
    }
    if let Some(report) = &meeting.artifacts.report_ref {
        println!("Report: {}", report);
    }
    if let Some(ack) = &meeting.artifacts.delivery_ack {
        println!("Delivered: {}", ack);
    }

    Ok(())
}

pub async fn handle_users_command(args: UsersCliArgs) -> Result<()> {
    let store = app::open_store()?;

    match args.command {
        UsersCommand::Onboard {
            email,
            name,
            company,
            role,
        } => {
            if email.trim().is_empty() {
                bail!("Email is required");
            }
            let user = store
                .onboard(NewUser {
                    email,
                    name,
                    company,
                    role,
                })
                .await?;
            print_user(&user);
            Ok(())
        }
        UsersCommand::Show { email } => match store.owner(&user_hash_key(&email)).await? {
            Some(user) => {
                print_user(&user);
                Ok(())
            }
            None => bail!("No onboarded user for {}", email),
        },
    }
}

fn print_user(user: &User) {
    println!("User #{}: {}", user.id, user.email);
    println!("Hash key:   {}", user.hash_key);
    if let Some(name) = &user.name {
        println!("Name:       {}", name);
    }
    if let Some(company) = &user.company {
        println!("Company:    {}", company);
    }
    if let Some(role) = &user.role {
        println!("Role:       {}", role);
    }
    println!("Onboarded:  {}", user.onboarded_at);
}
